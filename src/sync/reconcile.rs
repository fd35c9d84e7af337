use super::record::Record;

/// Merge an authoritative remote collection with the local snapshot.
///
/// The result follows the remote collection, except:
/// - records deleted locally but not yet on the remote (`deletes`) stay gone
/// - an unsynced local record replaces the remote copy when its
///   `last_modified` is strictly newer; otherwise the remote copy wins and the
///   local edit is dropped
/// - an unsynced local record the remote does not have is kept, so it can be
///   created or retried on the next pass
pub fn reconcile<T: Clone>(
  local: &[Record<T>],
  remote: Vec<Record<T>>,
  deletes: &[String],
) -> Vec<Record<T>> {
  let mut merged: Vec<Record<T>> = remote
    .into_iter()
    .filter(|record| !deletes.contains(&record.id))
    .collect();

  for pending in local.iter().filter(|record| !record.synced) {
    match merged.iter_mut().find(|record| record.id == pending.id) {
      Some(existing) => {
        if pending.last_modified > existing.last_modified {
          *existing = pending.clone();
        }
      }
      None => merged.push(pending.clone()),
    }
  }

  merged
}
