// lbackup/src/backup/naming.rs
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static ARCHIVE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^lbackup_storage_\d{4}_\d{2}_\d{2}\.zip$").expect("archive name pattern is valid")
});

/// `backup_{database}_{YYYY-MM-DD_HHMMSS}.sql`
pub fn dump_file_name(database: &str, created_at: NaiveDateTime) -> String {
    format!("backup_{}_{}.sql", database, created_at.format("%Y-%m-%d_%H%M%S"))
}

/// `lbackup_storage_{YYYY_MM_DD}.zip`
pub fn archive_file_name(date: NaiveDate) -> String {
    format!(
        "lbackup_storage_{:04}_{:02}_{:02}.zip",
        date.year(),
        date.month(),
        date.day()
    )
}

/// True when `basename` was produced by [`archive_file_name`]. Anything else sharing the
/// remote folder is left alone by retention.
pub fn is_archive_name(basename: &str) -> bool {
    ARCHIVE_NAME_PATTERN.is_match(basename)
}

/// Joins a configured remote prefix and an artifact name into an object key.
pub fn remote_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Archive names that survive a retention sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSet {
    keep_names: BTreeSet<String>,
}

impl RetentionSet {
    /// Keeps the archive for `today` and the one for the previous calendar day.
    pub fn for_date(today: NaiveDate) -> Self {
        let mut keep_names = BTreeSet::new();
        keep_names.insert(archive_file_name(today));
        if let Some(yesterday) = today.checked_sub_days(Days::new(1)) {
            keep_names.insert(archive_file_name(yesterday));
        }
        RetentionSet { keep_names }
    }

    pub fn keeps(&self, basename: &str) -> bool {
        self.keep_names.contains(basename)
    }

    /// A remote object is deleted only if it looks like one of our archives and is not kept.
    pub fn should_delete(&self, basename: &str) -> bool {
        is_archive_name(basename) && !self.keeps(basename)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keep_names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn dump_name_uses_database_and_timestamp() {
        let at = date(2024, 3, 1).and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(dump_file_name("shopdb", at), "backup_shopdb_2024-03-01_120000.sql");
    }

    #[test]
    fn archive_names_sort_by_date() {
        let mut names = vec![
            archive_file_name(date(2024, 11, 2)),
            archive_file_name(date(2023, 12, 31)),
            archive_file_name(date(2024, 2, 9)),
        ];
        names.sort();
        assert_eq!(
            names,
            vec![
                "lbackup_storage_2023_12_31.zip",
                "lbackup_storage_2024_02_09.zip",
                "lbackup_storage_2024_11_02.zip",
            ]
        );
    }

    #[test]
    fn pattern_rejects_lookalikes() {
        assert!(is_archive_name("lbackup_storage_2024_03_01.zip"));
        assert!(!is_archive_name("lbackup_storage_2024-03-01.zip"));
        assert!(!is_archive_name("lbackup_storage_24_03_01.zip"));
        assert!(!is_archive_name("lbackup_storage_2024_03_01.zip.bak"));
        assert!(!is_archive_name("old_lbackup_storage_2024_03_01.zip"));
        assert!(!is_archive_name("backup_shopdb_2024-03-01_120000.sql"));
    }

    #[test]
    fn keep_set_spans_leap_day() {
        let set = RetentionSet::for_date(date(2024, 3, 1));
        let names: Vec<&str> = set.names().collect();
        assert_eq!(
            names,
            vec!["lbackup_storage_2024_02_29.zip", "lbackup_storage_2024_03_01.zip"]
        );
        assert!(set.should_delete("lbackup_storage_2024_02_28.zip"));
        assert!(!set.should_delete("lbackup_storage_2024_03_01.zip"));
        assert!(!set.should_delete("notes.txt"));
    }

    #[test]
    fn keep_set_moves_with_the_run_date() {
        let first = RetentionSet::for_date(date(2024, 1, 1));
        let second = RetentionSet::for_date(date(2024, 1, 5));
        assert!(first.keeps("lbackup_storage_2023_12_31.zip"));
        assert!(second.should_delete("lbackup_storage_2024_01_01.zip"));
        assert!(second.keeps("lbackup_storage_2024_01_04.zip"));
        assert_eq!(second.names().count(), 2);
    }

    #[test]
    fn remote_key_trims_slashes() {
        assert_eq!(remote_key("/backup-files/", "a.zip"), "backup-files/a.zip");
        assert_eq!(remote_key("", "a.zip"), "a.zip");
        assert_eq!(remote_key("nested/dir", "a.sql"), "nested/dir/a.sql");
    }
}
