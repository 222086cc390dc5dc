use std::collections::HashMap;

/// Key/value fields of one spool line or job payload.
pub type RawRecord = HashMap<String, String>;

/// Split `line` into key/value fields.
///
/// Fragments are cut after every `entry_sep`, trimmed, then split at the
/// first `kv_sep`; everything after it (later separators included) is the
/// value. Fragments without a separator or with an empty key are skipped,
/// and a later duplicate key replaces an earlier one.
///
/// An empty separator yields an empty record so that a misconfigured
/// caller produces nothing instead of garbage.
pub fn tokenize(line: &str, entry_sep: &str, kv_sep: &str) -> RawRecord {
    let mut record = RawRecord::new();
    if entry_sep.is_empty() || kv_sep.is_empty() {
        return record;
    }

    for fragment in line.split_inclusive(entry_sep) {
        let fragment = fragment.strip_suffix(entry_sep).unwrap_or(fragment).trim();
        let Some((key, value)) = fragment.split_once(kv_sep) else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        record.insert(key.to_string(), value.to_string());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_spool_line() {
        let record = tokenize(
            "DATATYPE::SERVICEPERFDATA\tTIMET::1441791000\tHOSTNAME::xxx",
            "\t",
            "::",
        );
        assert_eq!(record.len(), 3);
        assert_eq!(record["DATATYPE"], "SERVICEPERFDATA");
        assert_eq!(record["TIMET"], "1441791000");
        assert_eq!(record["HOSTNAME"], "xxx");
    }

    #[test]
    fn value_keeps_later_separators() {
        let record = tokenize("CMD::check::with::colons\tX::1", "\t", "::");
        assert_eq!(record["CMD"], "check::with::colons");
    }

    #[test]
    fn last_duplicate_wins() {
        let record = tokenize("A::1\tA::2", "\t", "::");
        assert_eq!(record["A"], "2");
    }

    #[test]
    fn empty_separator_yields_empty_record() {
        assert!(tokenize("A::1\tB::2", "", "::").is_empty());
        assert!(tokenize("A::1\tB::2", "\t", "").is_empty());
    }

    #[test]
    fn empty_input_yields_empty_record() {
        assert!(tokenize("", "\t", "::").is_empty());
        assert!(tokenize("\n", "\t", "::").is_empty());
    }

    #[test]
    fn skips_fragments_without_key() {
        let record = tokenize("garbage\t::orphan\tA::1\t", "\t", "::");
        assert_eq!(record.len(), 1);
        assert_eq!(record["A"], "1");
    }

    #[test]
    fn trims_fragments_and_line_endings() {
        let record = tokenize("  A::1 \tB::two words\r\n", "\t", "::");
        assert_eq!(record["A"], "1");
        assert_eq!(record["B"], "two words");
    }
}
