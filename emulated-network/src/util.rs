pub mod serde_arc_str {
    use serde::de::{Error, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt::Formatter;
    use std::sync::Arc;

    pub fn serialize<S>(s: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArcStrVisitor;
        impl Visitor<'_> for ArcStrVisitor {
            type Value = Arc<str>;

            fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
                formatter.write_str("a node name")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: Error,
            {
                Ok(v.into())
            }
        }

        deserializer.deserialize_str(ArcStrVisitor)
    }
}

/// Splits text into whitespace-separated `key=value` pairs, ignoring other tokens
pub(crate) fn key_values(line: &str) -> impl Iterator<Item = (&str, &str)> {
    line.split_whitespace().filter_map(|token| token.split_once('='))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Named {
        #[serde(with = "serde_arc_str")]
        name: Arc<str>,
    }

    #[test]
    fn test_arc_str_serde() {
        let named: Named = serde_json::from_str(r#"{"name":"h9"}"#).unwrap();
        assert_eq!(&*named.name, "h9");
        assert_eq!(serde_json::to_string(&named).unwrap(), r#"{"name":"h9"}"#);
    }

    #[test]
    fn test_key_values() {
        let pairs: Vec<_> = key_values("tcp 6 src=10.1.1.2 dst=172.16.10.5 [ASSURED]").collect();
        assert_eq!(pairs, [("src", "10.1.1.2"), ("dst", "172.16.10.5")]);
    }
}
