use std::fmt::Write;

pub const LOG_OFF: u32 = 0;
pub const LOG_WARNING: u32 = 1;
pub const LOG_INFO: u32 = 2;

/// Two-sink logger: messages at or below `buffer_level` are kept in memory
/// (see `get_and_clear_logs()`), messages at or below `stderr_level` are
/// printed. Levels: 0 - off, 1 - warnings, 2 - info.
pub struct Logger {
    effective_level: u32,
    buffer_level: u32,
    stderr_level: u32,
    // level of the message currently being written through fmt::Write
    msg_level: u32,
    buffer: String,
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            effective_level: self.effective_level,
            buffer_level: self.buffer_level,
            stderr_level: self.stderr_level,
            msg_level: LOG_INFO,
            buffer: String::new(), // clones start with empty logs
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(LOG_OFF, LOG_WARNING)
    }
}

impl Logger {
    pub fn new(buffer_level: u32, stderr_level: u32) -> Self {
        Self {
            buffer_level,
            stderr_level,
            effective_level: std::cmp::max(buffer_level, stderr_level),
            msg_level: LOG_INFO,
            buffer: String::new(),
        }
    }

    pub fn warn(&mut self, s: &str) {
        if self.level_enabled(LOG_WARNING) {
            self.write_warning("Warning: ");
            self.emit(s);
            self.emit("\n");
        }
    }

    pub fn info(&mut self, s: &str) {
        if self.level_enabled(LOG_INFO) {
            self.msg_level = LOG_INFO;
            self.emit(s);
            self.emit("\n");
        }
    }

    /// Sink for `writeln!()` at info level; used by the `infoln!` macro.
    pub fn info_logger(&mut self) -> &mut Self {
        self.msg_level = LOG_INFO;
        self
    }

    /// Sink for `writeln!()` at warning level; used by the `warn!` macro.
    pub fn warning_logger(&mut self) -> &mut Self {
        self.msg_level = LOG_WARNING;
        self
    }

    pub fn write_warning(&mut self, s: &str) {
        self.msg_level = LOG_WARNING;
        self.emit(s);
    }

    #[inline(always)]
    pub fn level_enabled(&self, level: u32) -> bool {
        level <= self.effective_level
    }

    #[inline(always)]
    pub fn effective_level(&self) -> u32 {
        self.effective_level
    }

    #[inline(always)]
    pub fn buffer_level(&self) -> u32 {
        self.buffer_level
    }

    #[inline(always)]
    pub fn stderr_level(&self) -> u32 {
        self.stderr_level
    }

    pub fn set_buffer_level(&mut self, buffer_level: u32) {
        self.buffer_level = buffer_level;
        self.effective_level = std::cmp::max(self.stderr_level, self.buffer_level);
    }

    pub fn set_stderr_level(&mut self, stderr_level: u32) {
        self.stderr_level = stderr_level;
        self.effective_level = std::cmp::max(self.stderr_level, self.buffer_level);
    }

    pub fn get_buffer(&self) -> &str {
        &self.buffer
    }

    pub fn get_and_clear_logs(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn emit(&mut self, s: &str) {
        if self.msg_level <= self.buffer_level {
            self.buffer.push_str(s);
        }
        if self.msg_level <= self.stderr_level {
            eprint!("{}", s);
        }
    }
}

impl Write for Logger {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.emit(s);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_respects_levels() {
        let mut logger = Logger::new(LOG_WARNING, LOG_OFF);
        logger.info("not kept");
        logger.warn("kept");
        assert_eq!(logger.get_and_clear_logs(), "Warning: kept\n");
        assert_eq!(logger.get_buffer(), "");

        logger.set_buffer_level(LOG_INFO);
        writeln!(logger.info_logger(), "x={}", 3).unwrap();
        assert_eq!(logger.get_buffer(), "x=3\n");
    }

    #[test]
    fn clone_drops_buffer() {
        let mut logger = Logger::new(LOG_INFO, LOG_OFF);
        logger.info("hello");
        let cloned = logger.clone();
        assert_eq!(cloned.get_buffer(), "");
        assert_eq!(cloned.buffer_level(), LOG_INFO);
    }
}
