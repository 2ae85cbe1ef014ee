//! 變數持久化模組
//!
//! 以 Session 名稱為鍵保存變數快照，底線開頭與行偽變數不保存

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::variables::Variables;

/// 持久化錯誤
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("讀寫變數檔失敗: {0}")]
    Io(#[from] io::Error),

    #[error("變數檔格式錯誤: {0}")]
    Json(#[from] serde_json::Error),
}

/// 變數存檔介面
pub trait VariableStore {
    /// 讀取快照；沒有存檔時回傳空表
    fn load(&self, session: &str) -> Result<BTreeMap<String, Value>, PersistError>;

    fn save(&self, session: &str, variables: &Variables) -> Result<(), PersistError>;
}

/// 每個 Session 一個 JSON 檔：`<dir>/<session>.json`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session: &str) -> PathBuf {
        let safe: String = session
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl VariableStore for JsonFileStore {
    fn load(&self, session: &str) -> Result<BTreeMap<String, Value>, PersistError> {
        let path = self.path_for(session);
        if !path.exists() {
            debug!("變數檔不存在: {:?}", path);
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)?;
        let values: BTreeMap<String, Value> = serde_json::from_str(&content)?;
        info!("已載入 {} 個變數: {:?}", values.len(), path);
        Ok(values)
    }

    fn save(&self, session: &str, variables: &Variables) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(session);
        let snapshot = variables.persistent();
        let content = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&path, content)?;
        info!("已儲存 {} 個變數: {:?}", snapshot.len(), path);
        Ok(())
    }
}
