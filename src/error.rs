//! 流水线错误类型 (Pipeline error taxonomy)

use thiserror::Error;

/// 控制面/流水线错误
#[derive(Error, Debug)]
pub enum StreamError {
    /// 调用方参数错误, 不重试
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 输入源或编码器不可用, 调用方可重试 start
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// 上一次运行仍在退出中
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// 编码子进程已退出, 当前运行终止
    #[error("encoder sink is dead: {0}")]
    SinkDead(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// 控制协议中使用的稳定名称
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::InvalidArgument(_) => "InvalidArgument",
            StreamError::Unavailable(_) => "Unavailable",
            StreamError::Conflict(_) => "Conflict",
            StreamError::NotFound(_) => "NotFound",
            StreamError::SinkDead(_) => "SinkDead",
            StreamError::Io(_) => "Io",
        }
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
