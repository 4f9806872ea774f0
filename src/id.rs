use anyhow::anyhow;
use ulid::Ulid;

/// Returns a fresh record identifier.
///
/// ULIDs put a millisecond timestamp in the high bits, so identifiers
/// generated later in wall-clock time sort lexicographically after earlier
/// ones in both their binary and canonical-string encodings. The random low
/// bits keep repeated calls within the same millisecond collision-free.
pub fn next_id() -> Ulid {
    Ulid::new()
}

/// Parses a stored identifier back from its canonical 26-character string.
pub fn parse_id(value: &str) -> anyhow::Result<Ulid> {
    Ulid::from_string(value).map_err(|err| anyhow!("invalid record id `{value}`: {err}"))
}

/// The capture timestamp carried inside an identifier, in unix milliseconds.
///
/// Deriving `recorded_at` from the id's own clock keeps it monotonically
/// non-decreasing with id generation order within a process.
pub fn id_timestamp_unix_ms(id: Ulid) -> i64 {
    i64::try_from(id.timestamp_ms()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::{id_timestamp_unix_ms, next_id, parse_id};

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = next_id();
        thread::sleep(Duration::from_millis(2));
        let second = next_id();

        assert!(second.to_string() > first.to_string());
        assert!(id_timestamp_unix_ms(second) >= id_timestamp_unix_ms(first));
    }

    #[test]
    fn same_millisecond_ids_are_unique() {
        let mut ids: Vec<_> = (0..256).map(|_| next_id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 256);
    }

    #[test]
    fn parse_round_trips_canonical_string() {
        let id = next_id();
        let parsed = parse_id(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = parse_id("not-a-ulid").unwrap_err();
        assert!(
            err.to_string().contains("invalid record id"),
            "error: {err}"
        );
    }
}
