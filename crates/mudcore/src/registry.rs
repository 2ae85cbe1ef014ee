//! Session 物件登錄表
//!
//! 擁有 Trigger / Alias / Command / Timer / GMCP 觸發器、變數與背景任務。
//! 各集合以 id 為鍵（列出時依字母序），評估順序由優先級決定。

use std::collections::BTreeMap;
use std::rc::Rc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::alias::Alias;
use crate::command::{Command, SimpleCommand};
use crate::gmcp::GmcpTrigger;
use crate::pattern::PatternObject;
use crate::timer::Timer;
use crate::trigger::Trigger;
use crate::variables::Variables;

/// 可加入 Session 的物件
#[derive(Clone)]
pub enum SessionObject {
    Trigger(Rc<Trigger>),
    Alias(Rc<Alias>),
    Command(Rc<dyn Command>),
    Timer(Rc<Timer>),
    Gmcp(Rc<GmcpTrigger>),
}

impl SessionObject {
    pub fn id(&self) -> &str {
        match self {
            SessionObject::Trigger(t) => t.id(),
            SessionObject::Alias(a) => a.id(),
            SessionObject::Command(c) => c.id(),
            SessionObject::Timer(t) => t.id(),
            SessionObject::Gmcp(g) => g.name(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            SessionObject::Trigger(_) => ObjectKind::Trigger,
            SessionObject::Alias(_) => ObjectKind::Alias,
            SessionObject::Command(_) => ObjectKind::Command,
            SessionObject::Timer(_) => ObjectKind::Timer,
            SessionObject::Gmcp(_) => ObjectKind::Gmcp,
        }
    }
}

impl std::fmt::Debug for SessionObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.id())
    }
}

/// 物件種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Trigger,
    Alias,
    Command,
    Timer,
    Gmcp,
}

macro_rules! impl_from_object {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for SessionObject {
            fn from(obj: $ty) -> Self {
                SessionObject::$variant(Rc::new(obj))
            }
        }

        impl From<Rc<$ty>> for SessionObject {
            fn from(obj: Rc<$ty>) -> Self {
                SessionObject::$variant(obj)
            }
        }
    };
}

impl_from_object!(Trigger, Trigger);
impl_from_object!(Alias, Alias);
impl_from_object!(Timer, Timer);
impl_from_object!(GmcpTrigger, Gmcp);

impl From<SimpleCommand> for SessionObject {
    fn from(cmd: SimpleCommand) -> Self {
        SessionObject::Command(Rc::new(cmd))
    }
}

impl From<Rc<SimpleCommand>> for SessionObject {
    fn from(cmd: Rc<SimpleCommand>) -> Self {
        SessionObject::Command(cmd)
    }
}

impl From<Rc<dyn Command>> for SessionObject {
    fn from(cmd: Rc<dyn Command>) -> Self {
        SessionObject::Command(cmd)
    }
}

/// 鍵值對形式（鍵只用於呼叫端的組織，實際以物件 id 註冊）
impl<K: AsRef<str>> From<(K, SessionObject)> for SessionObject {
    fn from((_, obj): (K, SessionObject)) -> Self {
        obj
    }
}

/// `enable_group` 影響的各類物件數量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupCounts {
    pub triggers: usize,
    pub aliases: usize,
    pub commands: usize,
    pub timers: usize,
    pub gmcp: usize,
}

impl GroupCounts {
    pub fn total(&self) -> usize {
        self.triggers + self.aliases + self.commands + self.timers + self.gmcp
    }
}

/// Session 物件登錄表
#[derive(Default)]
pub struct SessionRegistry {
    triggers: BTreeMap<String, Rc<Trigger>>,
    aliases: BTreeMap<String, Rc<Alias>>,
    commands: BTreeMap<String, Rc<dyn Command>>,
    timers: BTreeMap<String, Rc<Timer>>,
    gmcp: BTreeMap<String, Rc<GmcpTrigger>>,
    variables: Variables,
    tasks: Vec<JoinHandle<()>>,
    unique: u64,
    seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// 加入物件；同 id 的舊物件會被取代並回傳
    pub fn add(&mut self, obj: SessionObject) -> Option<SessionObject> {
        let id = obj.id().to_string();
        debug!("加入 {:?}", obj);
        match obj {
            SessionObject::Trigger(t) => {
                t.core().set_seq(self.next_seq());
                self.triggers.insert(id, t).map(SessionObject::Trigger)
            }
            SessionObject::Alias(a) => {
                a.core().set_seq(self.next_seq());
                self.aliases.insert(id, a).map(SessionObject::Alias)
            }
            SessionObject::Command(c) => {
                c.core().set_seq(self.next_seq());
                for t in c.outcome_triggers() {
                    t.core().set_seq(self.next_seq());
                    self.triggers.insert(t.id().to_string(), t);
                }
                let old = self.commands.insert(id, c);
                if let Some(old) = &old {
                    old.reset();
                }
                old.map(SessionObject::Command)
            }
            SessionObject::Timer(t) => {
                let old = self.timers.insert(id, t);
                if let Some(old) = &old {
                    old.cancel();
                }
                old.map(SessionObject::Timer)
            }
            SessionObject::Gmcp(g) => {
                let old = self.gmcp.insert(id, g);
                if let Some(old) = &old {
                    old.abort();
                }
                old.map(SessionObject::Gmcp)
            }
        }
    }

    /// 依種類與 id 移除物件
    pub fn remove(&mut self, kind: ObjectKind, id: &str) -> Option<SessionObject> {
        debug!("移除 {:?}({})", kind, id);
        match kind {
            ObjectKind::Trigger => self.triggers.remove(id).map(SessionObject::Trigger),
            ObjectKind::Alias => self.aliases.remove(id).map(SessionObject::Alias),
            ObjectKind::Command => {
                let cmd = self.commands.remove(id)?;
                cmd.reset();
                for t in cmd.outcome_triggers() {
                    if self.triggers.get(t.id()).is_some_and(|cur| Rc::ptr_eq(cur, &t)) {
                        self.triggers.remove(t.id());
                    }
                }
                Some(SessionObject::Command(cmd))
            }
            ObjectKind::Timer => {
                let timer = self.timers.remove(id)?;
                timer.cancel();
                Some(SessionObject::Timer(timer))
            }
            ObjectKind::Gmcp => {
                let g = self.gmcp.remove(id)?;
                g.abort();
                Some(SessionObject::Gmcp(g))
            }
        }
    }

    pub fn contains(&self, kind: ObjectKind, id: &str) -> bool {
        match kind {
            ObjectKind::Trigger => self.triggers.contains_key(id),
            ObjectKind::Alias => self.aliases.contains_key(id),
            ObjectKind::Command => self.commands.contains_key(id),
            ObjectKind::Timer => self.timers.contains_key(id),
            ObjectKind::Gmcp => self.gmcp.contains_key(id),
        }
    }

    fn id_in_use(&self, id: &str) -> bool {
        self.triggers.contains_key(id)
            || self.aliases.contains_key(id)
            || self.commands.contains_key(id)
            || self.timers.contains_key(id)
    }

    /// 產生 Session 內唯一的 id（`prefix_n`，n 單調遞增）
    pub fn get_unique_id(&mut self, prefix: &str) -> String {
        loop {
            self.unique += 1;
            let id = format!("{}_{}", prefix, self.unique);
            if !self.id_in_use(&id) {
                return id;
            }
        }
    }

    /// 啟用或停用整個群組，回傳各類受影響的數量
    pub fn enable_group(&self, group: &str, enabled: bool) -> GroupCounts {
        let mut counts = GroupCounts::default();

        for t in self.triggers.values().filter(|t| t.group() == group) {
            t.set_enabled(enabled);
            counts.triggers += 1;
        }
        for a in self.aliases.values().filter(|a| a.group() == group) {
            a.set_enabled(enabled);
            counts.aliases += 1;
        }
        for c in self.commands.values().filter(|c| c.group() == group) {
            c.set_enabled(enabled);
            if !enabled {
                c.reset();
            }
            counts.commands += 1;
        }
        for t in self.timers.values().filter(|t| t.group() == group) {
            t.set_enabled(enabled);
            counts.timers += 1;
        }
        for g in self.gmcp.values().filter(|g| g.group() == group) {
            g.set_enabled(enabled);
            counts.gmcp += 1;
        }

        debug!("群組 {} {}: {:?}", group, if enabled { "啟用" } else { "停用" }, counts);
        counts
    }

    /// 已啟用的觸發器，依優先級排序（同優先級依加入順序）
    pub fn enabled_triggers(&self) -> Vec<Rc<Trigger>> {
        let mut list: Vec<_> = self.triggers.values().filter(|t| t.enabled()).cloned().collect();
        list.sort_by_key(|t| (t.priority(), t.core().seq()));
        list
    }

    pub fn enabled_aliases(&self) -> Vec<Rc<Alias>> {
        let mut list: Vec<_> = self.aliases.values().filter(|a| a.enabled()).cloned().collect();
        list.sort_by_key(|a| (a.priority(), a.core().seq()));
        list
    }

    pub fn enabled_commands(&self) -> Vec<Rc<dyn Command>> {
        let mut list: Vec<_> = self.commands.values().filter(|c| c.enabled()).cloned().collect();
        list.sort_by_key(|c| (c.priority(), c.core().seq()));
        list
    }

    pub fn trigger(&self, id: &str) -> Option<Rc<Trigger>> {
        self.triggers.get(id).cloned()
    }

    pub fn alias(&self, id: &str) -> Option<Rc<Alias>> {
        self.aliases.get(id).cloned()
    }

    pub fn command(&self, id: &str) -> Option<Rc<dyn Command>> {
        self.commands.get(id).cloned()
    }

    pub fn timer(&self, id: &str) -> Option<Rc<Timer>> {
        self.timers.get(id).cloned()
    }

    pub fn gmcp(&self, name: &str) -> Option<Rc<GmcpTrigger>> {
        self.gmcp.get(name).cloned()
    }

    /// 各類物件的 id（字母序）
    pub fn ids(&self, kind: ObjectKind) -> Vec<String> {
        match kind {
            ObjectKind::Trigger => self.triggers.keys().cloned().collect(),
            ObjectKind::Alias => self.aliases.keys().cloned().collect(),
            ObjectKind::Command => self.commands.keys().cloned().collect(),
            ObjectKind::Timer => self.timers.keys().cloned().collect(),
            ObjectKind::Gmcp => self.gmcp.keys().cloned().collect(),
        }
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    /// 追蹤背景任務，順便清掉已完成的
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|h| !h.is_finished());
        self.tasks.push(handle);
    }

    /// 尚未完成的背景任務數
    pub fn active_tasks(&self) -> usize {
        self.tasks.iter().filter(|h| !h.is_finished()).count()
    }

    /// 取消所有等待與背景任務，保留物件（重新連線前使用）
    pub fn reset_waits(&mut self) {
        for c in self.commands.values() {
            c.reset();
        }
        for t in self.triggers.values() {
            t.core().event().abort();
        }
        for g in self.gmcp.values() {
            g.abort();
        }
        for h in self.tasks.drain(..) {
            h.abort();
        }
    }

    /// 取消所有等待並清空所有集合；可重複呼叫
    pub fn clean(&mut self) {
        self.reset_waits();
        for t in self.timers.values() {
            t.cancel();
        }
        self.triggers.clear();
        self.aliases.clear();
        self.commands.clear();
        self.timers.clear();
        self.gmcp.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
            && self.aliases.is_empty()
            && self.commands.is_empty()
            && self.timers.is_empty()
            && self.gmcp.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use std::collections::HashMap;
    use std::time::Duration;

    fn trigger(id: &str) -> Trigger {
        Trigger::new(id, Pattern::contains(id))
    }

    #[test]
    fn test_add_and_remove() {
        let mut reg = SessionRegistry::new();
        reg.add(trigger("t1").into());
        reg.add(Alias::new("a1", Pattern::exact("n")).into());
        assert!(reg.contains(ObjectKind::Trigger, "t1"));
        assert!(reg.contains(ObjectKind::Alias, "a1"));

        assert!(reg.remove(ObjectKind::Trigger, "t1").is_some());
        assert!(reg.remove(ObjectKind::Trigger, "t1").is_none());
        assert!(!reg.contains(ObjectKind::Trigger, "t1"));
    }

    #[test]
    fn test_add_replaces_same_id() {
        let mut reg = SessionRegistry::new();
        assert!(reg.add(trigger("t").into()).is_none());
        let old = reg.add(trigger("t").with_priority(1).into());
        assert!(matches!(old, Some(SessionObject::Trigger(_))));
        assert_eq!(reg.trigger("t").unwrap().priority(), 1);
    }

    #[test]
    fn test_keyed_mapping_dispatch() {
        let mut objects: HashMap<String, SessionObject> = HashMap::new();
        objects.insert("x".into(), trigger("t").into());
        objects.insert("y".into(), Alias::new("a", Pattern::exact("a")).into());

        let mut reg = SessionRegistry::new();
        for obj in objects.into_iter().map(SessionObject::from) {
            reg.add(obj);
        }
        assert_eq!(reg.ids(ObjectKind::Trigger), vec!["t"]);
        assert_eq!(reg.ids(ObjectKind::Alias), vec!["a"]);
    }

    #[test]
    fn test_ids_are_alphabetical() {
        let mut reg = SessionRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            reg.add(trigger(id).into());
        }
        assert_eq!(reg.ids(ObjectKind::Trigger), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_enabled_triggers_sorted_with_insertion_tie_break() {
        let mut reg = SessionRegistry::new();
        reg.add(trigger("b").with_priority(50).into());
        reg.add(trigger("c").with_priority(10).into());
        reg.add(trigger("a").with_priority(50).into());
        reg.add(trigger("off").with_priority(1).with_enabled(false).into());

        let order: Vec<_> = reg.enabled_triggers().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_unique_id_skips_used() {
        let mut reg = SessionRegistry::new();
        reg.add(trigger("tri_2").into());
        assert_eq!(reg.get_unique_id("tri"), "tri_1");
        assert_eq!(reg.get_unique_id("tri"), "tri_3");
        assert_eq!(reg.get_unique_id("ali"), "ali_4");
    }

    #[test]
    fn test_enable_group_counts() {
        let mut reg = SessionRegistry::new();
        reg.add(trigger("t1").with_group("fight").into());
        reg.add(trigger("t2").with_group("fight").into());
        reg.add(trigger("t3").with_group("other").into());
        reg.add(Alias::new("a1", Pattern::exact("k")).with_group("fight").into());
        reg.add(SimpleCommand::new("c1", Pattern::exact("kill")).with_group("fight").into());
        reg.add(Timer::new("tm", Duration::from_secs(5)).with_group("fight").with_enabled(false).into());
        reg.add(GmcpTrigger::new("Char.Vitals").with_group("fight").into());

        let counts = reg.enable_group("fight", false);
        assert_eq!(
            counts,
            GroupCounts { triggers: 2, aliases: 1, commands: 1, timers: 1, gmcp: 1 }
        );
        assert_eq!(counts.total(), 6);
        assert!(!reg.trigger("t1").unwrap().enabled());
        assert!(reg.trigger("t3").unwrap().enabled());
        assert!(!reg.gmcp("Char.Vitals").unwrap().enabled());
    }

    #[test]
    fn test_command_registers_outcome_triggers() {
        let mut reg = SessionRegistry::new();
        let cmd = SimpleCommand::new("walk", Pattern::regex("^(n|s|e|w)$").unwrap())
            .with_success(Trigger::new("walk_ok", Pattern::regex("^Exits:").unwrap()))
            .with_retry(Trigger::new("walk_busy", Pattern::exact("You are busy.")));
        reg.add(cmd.into());
        assert_eq!(reg.ids(ObjectKind::Trigger), vec!["walk_busy", "walk_ok"]);
        assert!(reg.trigger("walk_ok").unwrap().keep_eval());

        reg.remove(ObjectKind::Command, "walk");
        assert!(reg.ids(ObjectKind::Trigger).is_empty());
    }

    #[test]
    fn test_clean_is_idempotent() {
        let mut reg = SessionRegistry::new();
        reg.add(trigger("t").into());
        reg.add(GmcpTrigger::new("Room.Info").into());
        reg.variables_mut().set("hp", 1);

        reg.clean();
        assert!(reg.is_empty());
        reg.clean();
        assert!(reg.is_empty());
        assert_eq!(reg.variables().get_or("hp", 0), serde_json::json!(1));
    }
}
