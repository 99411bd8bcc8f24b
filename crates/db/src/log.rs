use crate::config::LogFn;
use trivdb_core::LogLevel;

/// Routes engine diagnostics to `tracing` and, when set, the caller's callback
#[derive(Clone, Default)]
pub(crate) struct Logger {
    callback: Option<LogFn>,
    name: String,
}

impl Logger {
    pub fn new(callback: Option<LogFn>, name: impl Into<String>) -> Self {
        Self {
            callback,
            name: name.into(),
        }
    }

    pub fn emit(&self, level: LogLevel, message: &str) {
        let db = self.name.as_str();
        match level {
            LogLevel::Fatal | LogLevel::Error => tracing::error!(db, "{message}"),
            LogLevel::Warning => tracing::warn!(db, "{message}"),
            LogLevel::Trace => tracing::debug!(db, "{message}"),
        }
        if let Some(callback) = &self.callback {
            callback(level, message);
        }
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warning, message.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_callback_sees_every_level() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let logger = Logger::new(
            Some(Arc::new(move |level: LogLevel, msg: &str| {
                sink.lock().push((level, msg.to_string()))
            })),
            "t.tdb",
        );
        logger.error("bad magic");
        logger.warn("tag corrected");
        logger.emit(LogLevel::Trace, "recovered");
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (LogLevel::Error, "bad magic".to_string()));
        assert_eq!(seen[1].0, LogLevel::Warning);
        assert_eq!(seen[2].0, LogLevel::Trace);
    }
}
