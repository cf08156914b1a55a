//! Transactions log compaction.

use super::analysis::TransactionsAnalysis;
use super::entry::TransactionEntry;
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeSet;

/// Rewrites a log as the shortest entry sequence with the same outcome.
///
/// Files missing from `existing_files` are dropped. Every remaining file
/// gets a creation entry with its logged length, followed by a deletion
/// entry if its deletion was logged. The head file additionally gets the
/// store entries needed to reproduce its latest and last consistent
/// store.
///
/// # Errors
///
/// Returns a consistency error if a file numbered above the head file is
/// pending deletion; such a log cannot be expressed with creation entries
/// in ascending order.
pub fn compact(analysis: &TransactionsAnalysis, existing_files: &BTreeSet<u64>) -> CoreResult<Vec<TransactionEntry>> {
    let timestamp = analysis.max_timestamp();
    let head = analysis.head_file_number();
    let mut entries = Vec::new();

    for file in analysis.files().values() {
        if !existing_files.contains(&file.number) {
            continue;
        }
        let is_head = Some(file.number) == head;
        if file.deleted && head.map_or(false, |head| file.number > head) {
            return Err(CoreError::consistency(format!(
                "file {} above the head file is pending deletion",
                file.number
            )));
        }

        let creation_length = if is_head {
            analysis.last_consistent_length()
        } else {
            file.length
        };
        entries.push(TransactionEntry::FileCreation {
            timestamp,
            file_length: creation_length,
            file_number: file.number,
        });

        if file.deleted {
            entries.push(TransactionEntry::FileDeletion {
                timestamp,
                file_length: file.length,
                file_number: file.number,
            });
        } else if is_head {
            let previous = analysis.last_consistent_timestamp();
            let latest = analysis.head_latest_timestamp();
            if previous > 0 {
                entries.push(TransactionEntry::Store {
                    timestamp: previous,
                    file_length: creation_length,
                });
            }
            if latest > previous {
                entries.push(TransactionEntry::Store {
                    timestamp: latest,
                    file_length: analysis.head_latest_length(),
                });
            }
        }
    }
    Ok(entries)
}
