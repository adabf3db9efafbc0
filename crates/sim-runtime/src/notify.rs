//! User notifications emitted by settlements.

use parking_lot::Mutex;
use sim_core::CompanyId;
use tracing::info;

/// Sink for messages addressed to a company's players.
pub trait Notifier: Send + Sync {
    fn notify(&self, company: CompanyId, message: &str);
}

/// Writes notifications to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, company: CompanyId, message: &str) {
        info!(company = %company, "{message}");
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(CompanyId, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(CompanyId, String)> {
        self.sent.lock().clone()
    }

    /// Messages sent to `company`, oldest first.
    pub fn sent_to(&self, company: CompanyId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == company)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, company: CompanyId, message: &str) {
        self.sent.lock().push((company, message.to_string()));
    }
}
