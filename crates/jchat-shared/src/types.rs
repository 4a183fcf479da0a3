use crate::constants::DRAIN_FIELD_SEPARATOR;

/// Whether `name` can be used as a user, group or file name.
///
/// Names end up in space-separated header lists, in `$`-separated sign-in
/// summaries and in file system paths, so whitespace, path separators, the
/// summary separator and the special directory names are rejected.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|c| {
            c.is_whitespace()
                || c.is_control()
                || c == '/'
                || c == '\\'
                || c == DRAIN_FIELD_SEPARATOR
        })
}

/// Split a space-separated name list (`Peer`, `Others`), skipping empty items.
pub fn split_names(list: &str) -> Vec<String> {
    list.split(' ')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
