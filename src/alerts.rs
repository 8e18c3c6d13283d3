use log::info;

/// User-notification boundary. The desktop shell supplies a banner-backed
/// implementation; everything in the core only sees this trait.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Fallback used by the CLI and by tests: notifications land in the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("[notify] {title}: {body}");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures notifications for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, body: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((title.to_string(), body.to_string()));
        }
    }
}
