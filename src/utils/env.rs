//! Reading tuning knobs from the process environment.
//!
//! Integer values accept an optional `k`/`m`/`g` suffix (optionally followed by `b`),
//! so `CONCMARK_MARK_STACK_SIZE=4k` reads as `4096`.

fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    let mut value = std::env::var(var).ok()?;
    let value_len = value.len();

    if value_len == 0 {
        return None;
    }

    if value_len > 1 && matches!(value.as_bytes()[value_len - 1], b'b' | b'B') {
        value.truncate(value_len - 1);
    }

    let (digits, factor) = match value.as_bytes().last()? {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value.as_str(), 1),
    };

    digits.trim().parse::<f64>().ok().map(|x| (x, factor))
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;

    if value < 0.0 {
        return None;
    }

    Some(value as usize * factor)
}

pub fn read_float_from_env(var: &str) -> Option<f64> {
    read_float_and_factor_from_env(var).map(|x| x.0 * x.1 as f64)
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    let value = std::env::var(var).ok()?;

    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_uint_suffixes() {
        std::env::set_var("CONCMARK_TEST_UINT_K", "4k");
        std::env::set_var("CONCMARK_TEST_UINT_MB", "2MB");
        std::env::set_var("CONCMARK_TEST_UINT_PLAIN", "17");
        std::env::set_var("CONCMARK_TEST_UINT_BAD", "abc");

        assert_eq!(read_uint_from_env("CONCMARK_TEST_UINT_K"), Some(4096));
        assert_eq!(
            read_uint_from_env("CONCMARK_TEST_UINT_MB"),
            Some(2 * 1024 * 1024)
        );
        assert_eq!(read_uint_from_env("CONCMARK_TEST_UINT_PLAIN"), Some(17));
        assert_eq!(read_uint_from_env("CONCMARK_TEST_UINT_BAD"), None);
        assert_eq!(read_uint_from_env("CONCMARK_TEST_UINT_MISSING"), None);
    }

    #[test]
    fn test_read_float_and_bool() {
        std::env::set_var("CONCMARK_TEST_FLOAT", "2.5");
        std::env::set_var("CONCMARK_TEST_BOOL", "on");

        assert_eq!(read_float_from_env("CONCMARK_TEST_FLOAT"), Some(2.5));
        assert_eq!(read_bool_from_env("CONCMARK_TEST_BOOL"), Some(true));
    }
}
