//! 變數存儲模組
//!
//! Session 變數只由 Session 所在的事件迴圈存取；跨 Session 共享的
//! 全域變數使用 [`GlobalVariables`]，以 Mutex 保護。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

/// 不寫入持久化存檔的偽變數
pub const TRANSIENT_NAMES: [&str; 3] = ["%line", "%raw", "%copy"];

/// 底線開頭與行偽變數不持久化
pub fn is_transient(name: &str) -> bool {
    name.starts_with('_') || TRANSIENT_NAMES.contains(&name)
}

/// 變數表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    map: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    /// 取值，不存在時回傳 `default`
    ///
    /// # Example
    /// ```
    /// use mudcore::variables::Variables;
    ///
    /// let mut vars = Variables::new();
    /// vars.set("hp", 100);
    /// assert_eq!(vars.get_or("hp", 0), 100);
    /// assert_eq!(vars.get_or("mp", 50), 50);
    /// ```
    pub fn get_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.map.get(name).cloned().unwrap_or_else(|| default.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.map.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// 批次設定
    ///
    /// # Panics
    /// 名稱與值的數量不同或為空時
    pub fn set_many<S: AsRef<str>>(&mut self, names: &[S], values: Vec<Value>) {
        assert!(!names.is_empty(), "set_variables: 名稱列表不可為空");
        assert_eq!(
            names.len(),
            values.len(),
            "set_variables: 名稱與值的數量不一致"
        );
        for (name, value) in names.iter().zip(values) {
            self.map.insert(name.as_ref().to_string(), value);
        }
    }

    /// 批次取值，不存在的變數為 `Value::Null`
    ///
    /// # Panics
    /// 名稱列表為空時
    pub fn get_many<S: AsRef<str>>(&self, names: &[S]) -> Vec<Value> {
        assert!(!names.is_empty(), "get_variables: 名稱列表不可為空");
        names
            .iter()
            .map(|n| self.map.get(n.as_ref()).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// 可持久化的部分
    pub fn persistent(&self) -> BTreeMap<String, Value> {
        self.map
            .iter()
            .filter(|(k, _)| !is_transient(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn extend(&mut self, values: BTreeMap<String, Value>) {
        self.map.extend(values);
    }
}

/// 跨 Session 共享的全域變數
#[derive(Debug, Clone, Default)]
pub struct GlobalVariables {
    inner: Arc<Mutex<Variables>>,
}

impl GlobalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    // 持有鎖的執行緒 panic 後資料仍可使用
    fn lock(&self) -> MutexGuard<'_, Variables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.lock().set(name, value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    pub fn get_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.lock().get_or(name, default)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.lock().remove(name)
    }

    pub fn snapshot(&self) -> Variables {
        self.lock().clone()
    }
}
