//! Remove lists: CSV files of users to delete, columns `type,user,domain`.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::{info, warn};

use usersync_engine::UserKey;

use crate::error::{CliError, CliResult};

/// One row of a remove list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoveListRecord {
    #[serde(rename = "type")]
    identity_type: String,
    user: String,
    #[serde(default)]
    domain: String,
}

impl From<&UserKey> for RemoveListRecord {
    fn from(key: &UserKey) -> Self {
        let (identity_type, user, domain) = key.parts();
        Self {
            identity_type: identity_type.to_string(),
            user: user.to_string(),
            domain: domain.to_string(),
        }
    }
}

/// Read user keys from a remove list.
///
/// Rows that do not form a valid key are logged and skipped.
pub fn read_remove_list<R: Read>(reader: R) -> CliResult<Vec<UserKey>> {
    let mut rdr = csv::Reader::from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| CliError::RemoveList(format!("Failed to read header: {e}")))?;
    if !headers.iter().any(|h| h == "type") || !headers.iter().any(|h| h == "user") {
        return Err(CliError::RemoveList(
            "CSV missing required columns: type, user".to_string(),
        ));
    }

    let mut keys = Vec::new();
    for (idx, result) in rdr.deserialize::<RemoveListRecord>().enumerate() {
        let line_num = idx + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_num, error = %e, "Skipping unreadable remove list row");
                continue;
            }
        };
        let raw = format!(
            "{},{},{}",
            record.identity_type.trim(),
            record.user.trim(),
            record.domain.trim()
        );
        match UserKey::parse(&raw) {
            Ok(key) => keys.push(key),
            Err(e) => warn!(line = line_num, error = %e, "Skipping invalid remove list row"),
        }
    }

    info!(users = keys.len(), "Remove list read");
    Ok(keys)
}

/// Write user keys as a remove list.
pub fn write_remove_list<W: Write>(keys: &[UserKey], writer: W) -> CliResult<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    if keys.is_empty() {
        wtr.write_record(["type", "user", "domain"])
            .map_err(|e| CliError::RemoveList(format!("CSV write error: {e}")))?;
    }
    for key in keys {
        wtr.serialize(RemoveListRecord::from(key))
            .map_err(|e| CliError::RemoveList(format!("CSV write error: {e}")))?;
    }

    wtr.flush()
        .map_err(|e| CliError::Io(format!("Failed to flush CSV: {e}")))?;

    Ok(())
}
