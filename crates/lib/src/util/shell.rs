/// Quote `value` for POSIX `sh` using single quotes.
pub fn quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', r"'\''"))
}
