//! Docker error text handling.

/// Trims extra information from a Docker daemon error. On Windows the
/// "extra info:" suffix can expose environment variables and other
/// sensitive data, so it never reaches callers or logs.
pub fn trim_extra_info(message: &str) -> String {
    match message.find("extra info:") {
        Some(index) if index > 0 => {
            let mut s = message[..index].trim();
            s = s.trim_end_matches("(0x2)").trim();
            s.to_string()
        }
        _ => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trims_extra_info() {
        let raw = "container cannot start (0x2) extra info: {\"SystemRoot\":\"C:\\\\Windows\"}";
        assert_eq!(trim_extra_info(raw), "container cannot start");
    }

    #[test]
    fn test_passthrough_without_marker() {
        assert_eq!(
            trim_extra_info("no such image: alpine:latest"),
            "no such image: alpine:latest"
        );
    }
}
