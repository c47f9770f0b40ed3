use crate::events::EventKind;

/// Why an inbound client frame was discarded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unknown event type: {0}")]
    UnknownKind(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("{0} events are server-originated")]
    ServerOnly(EventKind),
    #[error("binary frame is not UTF-8")]
    NotUtf8,
}

impl FrameError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::UnknownKind(_) => "unknown_kind",
            Self::MissingField(_) => "missing_field",
            Self::ServerOnly(_) => "server_only",
            Self::NotUtf8 => "not_utf8",
        }
    }
}

/// Failure reported by a [`ChatStore`](crate::persistence::ChatStore).
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage rejected write: {0}")]
    Rejected(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_display() {
        assert_eq!(
            FrameError::ServerOnly(EventKind::Status).to_string(),
            "status events are server-originated"
        );
        assert_eq!(FrameError::MissingField("content").to_string(), "missing field: content");
    }

    #[test]
    fn frame_error_reasons_are_distinct() {
        let reasons = [
            FrameError::InvalidJson(String::new()).reason(),
            FrameError::UnknownKind(String::new()).reason(),
            FrameError::MissingField("x").reason(),
            FrameError::ServerOnly(EventKind::Status).reason(),
            FrameError::NotUtf8.reason(),
        ];
        let unique: std::collections::HashSet<_> = reasons.iter().collect();
        assert_eq!(unique.len(), reasons.len());
    }
}
