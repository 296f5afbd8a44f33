use lazy_static::lazy_static;
use std::collections::HashMap;

const DATE: &str = r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])";
const TIME: &str = r"([01]\d|2[0-3]):[0-5]\d:[0-5]\d(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)";
const IPV4_OCTET: &str = r"(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)";
const HOST_LABEL: &str = r"[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?";

lazy_static! {
    static ref FORMAT_PATTERNS: HashMap<&'static str, String> = {
        let mut m = HashMap::new();
        m.insert("date", DATE.to_string());
        m.insert("time", TIME.to_string());
        m.insert("date-time", format!("{}T{}", DATE, TIME));
        m.insert("email", r"[^\s@]+@[^\s@]+\.[^\s@]+".to_string());
        m.insert("ipv4", format!(r"({}\.){{3}}{}", IPV4_OCTET, IPV4_OCTET));
        // full form only, no :: compression
        m.insert("ipv6", r"([0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}".to_string());
        m.insert(
            "uuid",
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}"
                .to_string(),
        );
        m.insert("hostname", format!(r"{}(\.{})*", HOST_LABEL, HOST_LABEL));
        m.insert("uri", r"[a-zA-Z][a-zA-Z0-9+.-]*:[^\s]*".to_string());
        m
    };
}

pub fn lookup_format(name: &str) -> Option<&str> {
    FORMAT_PATTERNS.get(name).map(|s| s.as_str())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rx::parse_regex;

    #[test]
    fn all_formats_parse() {
        for (name, rx) in FORMAT_PATTERNS.iter() {
            assert!(parse_regex(rx).is_ok(), "format {name}: {rx}");
        }
        assert!(lookup_format("date-time").unwrap().contains('T'));
        assert!(lookup_format("color").is_none());
    }
}
