mod forms;
mod health;

pub use forms::{ECHO_FEATURE, MAX_ECHO_TEXT_LEN, echo, issue_csrf_token};
pub use health::{health_check, metrics_snapshot};
