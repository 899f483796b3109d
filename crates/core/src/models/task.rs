use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// 任务定义
///
/// 表示一个编排单元，可能由有序子任务组成一棵树。任务既可以由本节点
/// 发起（`is_received = false`，经传输层发送给远端执行），也可以是从
/// 远端接收的（`is_received = true`，由本节点的动作处理器执行）。
///
/// # 字段说明
///
/// - `id`: 任务的全局唯一标识符，发送方生成，接收方沿用同一个id
/// - `task_type`: 任务类型（simple/chord/synchronous）
/// - `task_metadata`: 开放的键值包，例如synchronous任务的算法名，
///   chord子任务的聚合标记也存放在这里
/// - `action` / `queue_name`: 动作注册表的路由键
/// - `status`: 状态机状态，见 [`TaskStatus`]
/// - `parent_id` / `order`: 子任务归属及其在兄弟间的确定性位置
/// - `pingback_date` / `expiration_date`: 调度器延迟作业的到期时间，
///   对应的 `*_pending` 标志与作业表中是否存在作业保持一致
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub task_metadata: Value,
    pub action: String,
    pub queue_name: String,
    pub status: TaskStatus,
    pub is_received: bool,
    pub is_local: bool,
    pub parent_id: Option<String>,
    pub order: Option<i32>,
    pub sender_url: String,
    pub receiver_url: String,
    pub sender_ssl_cert: String,
    pub receiver_ssl_cert: String,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub input_data: Option<Value>,
    pub input_async_data: Option<Value>,
    pub output_data: Option<Value>,
    pub output_async_data: Option<Value>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub pingback_pending: bool,
    pub expiration_date: Option<DateTime<Utc>>,
    pub expiration_pending: bool,
}

/// 任务类型
///
/// 各类型的生命周期差异集中在行为表里，见 [`TaskType::behavior`]。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Simple,
    Chord,
    Synchronous,
}

/// 各任务类型的终态行为表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskBehavior {
    /// 处理器返回后是否自动置为finished
    pub auto_finish_after_handler: bool,
    /// 到达终态后是否向原始发送方回送状态更新
    pub send_update_to_sender: bool,
}

impl TaskType {
    pub fn behavior(&self) -> TaskBehavior {
        match self {
            // 简单任务：处理器返回即完成，并回报发送方
            TaskType::Simple => TaskBehavior {
                auto_finish_after_handler: true,
                send_update_to_sender: true,
            },
            // chord任务：所有子任务终态后才完成，完成时回报发送方
            TaskType::Chord => TaskBehavior {
                auto_finish_after_handler: false,
                send_update_to_sender: true,
            },
            // 同步任务：处理器自行决定何时完成，不走异步更新通道
            TaskType::Synchronous => TaskBehavior {
                auto_finish_after_handler: false,
                send_update_to_sender: false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Simple => "simple",
            TaskType::Chord => "chord",
            TaskType::Synchronous => "synchronous",
        }
    }
}

/// 任务状态机状态
///
/// 允许的迁移边见 [`TaskStatus::can_transition_to`]，任何直接从
/// created跳到finished的写入都会被拒绝。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Sent,
    Received,
    Executing,
    WaitingSubtasks,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }

    /// 状态机迁移表
    ///
    /// 发送方副本的sent可以直接被远端的finished/error更新覆盖，因为
    /// 远端已经替它走完了received/executing阶段。
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Created => matches!(to, Sent | Received | Error),
            Sent => matches!(to, Executing | Finished | Error),
            Received => matches!(to, Executing | Error),
            Executing => matches!(to, WaitingSubtasks | Finished | Error),
            WaitingSubtasks => matches!(to, Finished | Error),
            Finished | Error => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Sent => "sent",
            TaskStatus::Received => "received",
            TaskStatus::Executing => "executing",
            TaskStatus::WaitingSubtasks => "waiting_subtasks",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }
}

/// chord子任务聚合标记在metadata中的键
const CHORD_APPLIED_KEY: &str = "chord_applied";
/// 终态更新投递失败后等待重发的标记
const UPDATE_UNSENT_KEY: &str = "update_unsent";
/// pingback重复触发间隔（秒），缺省时pingback只触发一次
const PINGBACK_INTERVAL_KEY: &str = "pingback_interval_seconds";

impl Task {
    /// 创建新任务，默认是本节点发起的created状态任务
    pub fn new(task_type: TaskType, action: String, queue_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            task_metadata: json!({}),
            action,
            queue_name,
            status: TaskStatus::Created,
            is_received: false,
            is_local: false,
            parent_id: None,
            order: None,
            sender_url: String::new(),
            receiver_url: String::new(),
            sender_ssl_cert: String::new(),
            receiver_ssl_cert: String::new(),
            created_date: now,
            last_modified_date: now,
            input_data: None,
            input_async_data: None,
            output_data: None,
            output_async_data: None,
            pingback_date: None,
            pingback_pending: false,
            expiration_date: None,
            expiration_pending: false,
        }
    }

    pub fn behavior(&self) -> TaskBehavior {
        self.task_type.behavior()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 刷新最后修改时间，所有状态写入前调用
    pub fn touch(&mut self) {
        self.last_modified_date = Utc::now();
    }

    fn metadata_flag(&self, key: &str) -> bool {
        self.task_metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn set_metadata(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.task_metadata {
            map.insert(key.to_string(), value);
        } else {
            self.task_metadata = json!({ key: value });
        }
    }

    /// 该子任务的输出是否已经被聚合进chord父任务
    pub fn chord_applied(&self) -> bool {
        self.metadata_flag(CHORD_APPLIED_KEY)
    }

    pub fn mark_chord_applied(&mut self) {
        self.set_metadata(CHORD_APPLIED_KEY, Value::Bool(true));
    }

    /// 是否有一条终态更新尚未成功送达发送方
    pub fn update_unsent(&self) -> bool {
        self.metadata_flag(UPDATE_UNSENT_KEY)
    }

    pub fn set_update_unsent(&mut self, pending: bool) {
        self.set_metadata(UPDATE_UNSENT_KEY, Value::Bool(pending));
    }

    /// pingback的重复间隔，未配置时为一次性pingback
    pub fn pingback_interval_seconds(&self) -> Option<i64> {
        self.task_metadata
            .get(PINGBACK_INTERVAL_KEY)
            .and_then(Value::as_i64)
    }

    /// 序列化为对外JSON形态
    ///
    /// `full = true` 时内联父任务（父任务本身以非full形态展开），
    /// 否则只携带 `parent_id` 外键。
    pub fn to_value(&self, full: bool, parent: Option<&Task>) -> Value {
        let mut ret = json!({
            "id": self.id,
            "task_type": self.task_type,
            "task_metadata": self.task_metadata,
            "action": self.action,
            "queue_name": self.queue_name,
            "status": self.status,
            "order": self.order,
            "sender_url": self.sender_url,
            "receiver_url": self.receiver_url,
            "is_received": self.is_received,
            "is_local": self.is_local,
            "sender_ssl_cert": self.sender_ssl_cert,
            "receiver_ssl_cert": self.receiver_ssl_cert,
            "created_date": self.created_date,
            "last_modified_date": self.last_modified_date,
            "input_data": self.input_data,
            "input_async_data": self.input_async_data,
            "output_data": self.output_data,
            "output_async_data": self.output_async_data,
            "pingback_date": self.pingback_date,
            "expiration_date": self.expiration_date,
            "pingback_pending": self.pingback_pending,
            "expiration_pending": self.expiration_pending,
        });
        if full {
            ret["parent"] = parent
                .map(|p| p.to_value(false, None))
                .unwrap_or(Value::Null);
        } else {
            ret["parent_id"] = json!(self.parent_id);
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_shape() {
        assert_eq!(
            serde_json::to_value(TaskStatus::WaitingSubtasks).unwrap(),
            json!("waiting_subtasks")
        );
        assert_eq!(serde_json::to_value(TaskType::Chord).unwrap(), json!("chord"));
    }

    #[test]
    fn test_transition_edges() {
        use TaskStatus::*;
        assert!(Created.can_transition_to(Sent));
        assert!(Received.can_transition_to(Executing));
        assert!(Executing.can_transition_to(WaitingSubtasks));
        assert!(WaitingSubtasks.can_transition_to(Finished));
        assert!(Sent.can_transition_to(Finished));

        // created不能直接到finished，终态不能再迁移
        assert!(!Created.can_transition_to(Finished));
        assert!(!Created.can_transition_to(Executing));
        assert!(!Finished.can_transition_to(Executing));
        assert!(!Error.can_transition_to(Finished));
    }

    #[test]
    fn test_behavior_table() {
        assert!(TaskType::Simple.behavior().auto_finish_after_handler);
        assert!(TaskType::Simple.behavior().send_update_to_sender);
        assert!(!TaskType::Chord.behavior().auto_finish_after_handler);
        assert!(TaskType::Chord.behavior().send_update_to_sender);
        assert!(!TaskType::Synchronous.behavior().send_update_to_sender);
    }

    #[test]
    fn test_chord_applied_marker() {
        let mut task = Task::new(TaskType::Simple, "a".into(), "q".into());
        assert!(!task.chord_applied());
        task.mark_chord_applied();
        assert!(task.chord_applied());
        // 其他metadata键不受影响
        assert!(task.pingback_interval_seconds().is_none());
    }

    #[test]
    fn test_to_value_parent_inline() {
        let parent = Task::new(TaskType::Chord, "p".into(), "q".into());
        let mut sub = Task::new(TaskType::Simple, "s".into(), "q".into());
        sub.parent_id = Some(parent.id.clone());
        sub.order = Some(0);

        let flat = sub.to_value(false, None);
        assert_eq!(flat["parent_id"], json!(parent.id));
        assert!(flat.get("parent").is_none());

        let full = sub.to_value(true, Some(&parent));
        assert_eq!(full["parent"]["id"], json!(parent.id));
        assert_eq!(full["parent"]["parent_id"], Value::Null);
    }
}
