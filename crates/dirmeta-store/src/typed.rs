//! Boolean and integer metadata stored as strings

use crate::metafile::Metafile;
use tracing::warn;

const TRUE: &str = "true";
const FALSE: &str = "false";

fn bool_str(value: bool) -> &'static str {
    if value { TRUE } else { FALSE }
}

impl Metafile {
    /// Get a boolean stored as `"true"` or `"false"` (any case)
    pub fn get_boolean(&self, file_name: &str, key: &str, default: bool) -> bool {
        let stored = self.get(file_name, key, bool_str(default));
        if stored.eq_ignore_ascii_case(TRUE) {
            true
        } else if stored.eq_ignore_ascii_case(FALSE) {
            false
        } else {
            warn!(
                "Boolean metadata {}/{} has value {:?}, using default",
                file_name, key, stored
            );
            default
        }
    }

    pub fn set_boolean(&self, file_name: &str, key: &str, default: bool, value: bool) -> bool {
        self.set(file_name, key, bool_str(default), bool_str(value))
    }

    /// Get a decimal integer; unparsable values yield the default
    pub fn get_integer(&self, file_name: &str, key: &str, default: i64) -> i64 {
        self.get(file_name, key, &default.to_string())
            .trim()
            .parse()
            .unwrap_or(default)
    }

    pub fn set_integer(&self, file_name: &str, key: &str, default: i64, value: i64) -> bool {
        self.set(file_name, key, &default.to_string(), &value.to_string())
    }
}
