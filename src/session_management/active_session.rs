use crate::session_management::session::Session;
use crate::storage::database::Database;

/// The open session of a workspace: its catalog row as last written, its
/// private database and the traffic totals not yet flushed to disk.
pub struct ActiveSession {
    /// The session metadata and state.
    pub session: Session,
    /// Private database file exclusively owned by this session.
    pub db: Database,
    /// Name of the key/value metadata mirror table in `db`.
    pub meta_table: String,
}

impl ActiveSession {
    pub fn id(&self) -> &str {
        &self.session.session_id
    }

    pub fn record_traffic(&mut self, size: u64) {
        self.session.record_count += 1;
        self.session.data_size += size;
    }
}
