use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ParseError, RenderError};

use super::normalize::{push, RawEntry};
use super::Host;

/// YAML tree that keeps repeated mapping keys, which `serde_yaml::Value`
/// refuses to load. A host listed twice must surface as a duplicate host.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Null,
    Scalar(String),
    Sequence(Vec<Node>),
    Mapping(Vec<(Node, Node)>),
}

impl Node {
    fn scalar(&self) -> Option<&str> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl<'de> Visitor<'de> for V {
            type Value = Node;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a YAML scalar, sequence or mapping")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
                Ok(Node::Scalar(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Node, E> {
                Ok(Node::Scalar(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Node, E> {
                Ok(Node::Scalar(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Node, E> {
                Ok(Node::Scalar(v.to_string()))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
                Ok(Node::Scalar(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
                Ok(Node::Scalar(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
                Ok(Node::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Node, E> {
                Ok(Node::Null)
            }

            fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Node, D::Error> {
                Node::deserialize(deserializer)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Node::Sequence(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Node, A::Error> {
                let mut pairs = Vec::new();
                while let Some(pair) = map.next_entry()? {
                    pairs.push(pair);
                }
                Ok(Node::Mapping(pairs))
            }
        }

        deserializer.deserialize_any(V)
    }
}

fn syntax(message: impl Into<String>) -> ParseError {
    ParseError::Syntax {
        format: "yaml",
        message: message.into(),
    }
}

fn mapping_entry(
    pairs: &[(Node, Node)],
    implied_hostname: Option<&str>,
) -> Result<RawEntry, ParseError> {
    let mut entry = RawEntry::new();
    if let Some(hostname) = implied_hostname {
        push(&mut entry, "hostname", hostname);
    }
    for (key, value) in pairs {
        let key = key
            .scalar()
            .ok_or_else(|| syntax("host attribute keys must be scalars"))?;
        if let Some(value) = value.scalar() {
            push(&mut entry, key, value);
        }
    }
    // An explicit hostname attribute overrides the mapping key.
    if implied_hostname.is_some() && entry.iter().skip(1).any(|(key, _)| key == "hostname") {
        entry.remove(0);
    }
    Ok(entry)
}

fn list_entry(item: &Node) -> Result<RawEntry, ParseError> {
    match item {
        Node::Mapping(pairs) => mapping_entry(pairs, None),
        other => {
            let name = other
                .scalar()
                .ok_or_else(|| syntax("host entries must be mappings or names"))?;
            let mut entry = RawEntry::new();
            push(&mut entry, "hostname", name);
            push(&mut entry, "ip_address", name);
            Ok(entry)
        }
    }
}

fn host_list(node: &Node) -> Result<Vec<RawEntry>, ParseError> {
    match node {
        Node::Sequence(items) => items.iter().map(list_entry).collect(),
        Node::Mapping(by_name) => by_name
            .iter()
            .map(|(name, attributes)| {
                let name = name
                    .scalar()
                    .ok_or_else(|| syntax("hostnames must be scalars"))?;
                match attributes {
                    Node::Mapping(pairs) => mapping_entry(pairs, Some(name)),
                    Node::Null => mapping_entry(&[], Some(name)),
                    _ => Err(syntax(format!("attributes of `{name}` must be a mapping"))),
                }
            })
            .collect(),
        Node::Null => Ok(Vec::new()),
        Node::Scalar(_) => Err(syntax("expected a list of hosts")),
    }
}

pub(super) fn entries(source: &str) -> Result<Vec<RawEntry>, ParseError> {
    if source.trim().is_empty() {
        return Ok(Vec::new());
    }
    let document: Node = serde_yaml::from_str(source).map_err(|e| syntax(e.to_string()))?;

    if let Node::Mapping(pairs) = &document {
        for key in ["hosts", "nodes"] {
            if let Some((_, list)) = pairs.iter().find(|(k, _)| k.scalar() == Some(key)) {
                return host_list(list);
            }
        }
    }
    host_list(&document)
}

#[derive(Serialize)]
struct Document<'a> {
    hosts: &'a [Host],
}

pub(super) fn render(hosts: &[Host]) -> Result<String, RenderError> {
    Ok(serde_yaml::to_string(&Document { hosts })?)
}
