/// Leveled logging sink injected into the transport core.
///
/// Components never log through a process-wide singleton; callers hand in
/// whatever sink they want, or [`NopLogger`] when they want silence.
pub trait UiLogger: Send + Sync {
    fn d(&self, tag: &str, message: &str);
    fn i(&self, tag: &str, message: &str);
    fn w(&self, tag: &str, message: &str);
    fn e(&self, tag: &str, message: &str);
}

/// Discards every message. The default sink when none is supplied.
pub struct NopLogger;

impl UiLogger for NopLogger {
    fn d(&self, _tag: &str, _message: &str) {}
    fn i(&self, _tag: &str, _message: &str) {}
    fn w(&self, _tag: &str, _message: &str) {}
    fn e(&self, _tag: &str, _message: &str) {}
}

/// Forwards messages to the `log` facade, with the tag as the log target.
///
/// Host applications that already run a `log`-based pipeline can plug this in
/// and keep their existing filtering and formatting.
pub struct FacadeLogger;

impl UiLogger for FacadeLogger {
    fn d(&self, tag: &str, message: &str) {
        log::debug!(target: tag, "{}", message);
    }

    fn i(&self, tag: &str, message: &str) {
        log::info!(target: tag, "{}", message);
    }

    fn w(&self, tag: &str, message: &str) {
        log::warn!(target: tag, "{}", message);
    }

    fn e(&self, tag: &str, message: &str) {
        log::error!(target: tag, "{}", message);
    }
}
