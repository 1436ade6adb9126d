//! 错误分类
//!
//! 按有序规则表对错误消息做大小写无关的子串匹配，第一条命中的规则生效。
//! 规则顺序固定且有意义：例如 "permission denied: connection" 归为权限错误而不是网络错误。

use serde::{Deserialize, Serialize};

/// 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 网络错误（含超时）
    Network,
    /// 权限错误
    Permission,
    /// 磁盘空间不足
    DiskFull,
    /// 文件不存在
    FileNotFound,
    /// 临时错误（资源繁忙等）
    Temporary,
    /// 未知错误
    Unknown,
}

impl ErrorKind {
    /// 是否可重试
    ///
    /// 只有权限错误和文件不存在不可重试，其余（包括未知错误）都会进入重试流程
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Permission | ErrorKind::FileNotFound)
    }

    /// 用于日志和通知的中文名称
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "网络错误",
            ErrorKind::Permission => "权限错误",
            ErrorKind::DiskFull => "磁盘空间不足",
            ErrorKind::FileNotFound => "文件不存在",
            ErrorKind::Temporary => "临时错误",
            ErrorKind::Unknown => "未知错误",
        }
    }

    /// 所有错误类型
    pub fn all() -> [ErrorKind; 6] {
        [
            ErrorKind::Network,
            ErrorKind::Permission,
            ErrorKind::DiskFull,
            ErrorKind::FileNotFound,
            ErrorKind::Temporary,
            ErrorKind::Unknown,
        ]
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Permission => "permission",
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::Temporary => "temporary",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// 分类规则：任一模式命中即归为 `kind`
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    /// 小写的匹配子串
    patterns: Vec<String>,
    /// 命中后的错误类型
    kind: ErrorKind,
}

impl ClassifierRule {
    pub fn new<I, S>(patterns: I, kind: ErrorKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
            kind,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn matches(&self, lowered: &str) -> bool {
        self.patterns.iter().any(|p| lowered.contains(p.as_str()))
    }
}

/// 错误分类器
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                ClassifierRule::new(["permission", "access"], ErrorKind::Permission),
                ClassifierRule::new(["no space", "disk full"], ErrorKind::DiskFull),
                ClassifierRule::new(["not found", "no such file"], ErrorKind::FileNotFound),
                ClassifierRule::new(["network", "timeout", "connection"], ErrorKind::Network),
                ClassifierRule::new(["temporary", "busy"], ErrorKind::Temporary),
            ],
        }
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加自定义规则（排在内置规则之后）
    pub fn with_rule(mut self, rule: ClassifierRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// 按消息分类
    pub fn classify(&self, message: &str) -> ErrorKind {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// 按 anyhow 错误分类（匹配完整的上下文链）
    pub fn classify_error(&self, error: &anyhow::Error) -> ErrorKind {
        self.classify(&format!("{:#}", error))
    }
}
