//! Run-date parsing

use chrono::NaiveDate;

use crate::error::{LakeError, Result};

/// Parse a run date written as `YYYY-MM-DD` or `YYYYMMDD`
pub fn parse_run_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    let format = if trimmed.contains('-') { "%Y-%m-%d" } else { "%Y%m%d" };
    NaiveDate::parse_from_str(trimmed, format)
        .map_err(|e| LakeError::InvalidDate(format!("{}: {}", trimmed, e)))
}

/// Underscore form used in date-suffixed table names, e.g. `2025_11_20`
pub fn table_suffix(date: NaiveDate) -> String {
    date.format("%Y_%m_%d").to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_forms() {
        let expected = NaiveDate::from_ymd_opt(2025, 11, 20).unwrap();
        assert_eq!(parse_run_date("2025-11-20").unwrap(), expected);
        assert_eq!(parse_run_date("20251120").unwrap(), expected);
        assert!(parse_run_date("2025/11/20").is_err());
    }

    #[test]
    fn test_table_suffix() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert_eq!(table_suffix(date), "2025_01_02");
    }
}
