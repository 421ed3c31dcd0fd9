use super::endpoints::{Endpoint, WILDCARD_METHOD};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("duplicate route {method} {path}")]
    Duplicate { method: String, path: String },
    #[error("conflicting path parameter {new:?} (existing {existing:?}) in {path}")]
    ParamConflict {
        path: String,
        existing: String,
        new: String,
    },
    #[error("catch-all segment must be last in {0}")]
    TailNotLast(String),
}

/// Routes `(method, path)` pairs to endpoints.
///
/// Path segments starting with `:` capture one segment; a final segment
/// starting with `*` captures the rest of the path. Lookup tries the
/// exact method first, then endpoints registered under the wildcard
/// method sentinel. Static segments win over parameters.
#[derive(Debug, Default)]
pub struct Router {
    methods: HashMap<String, Node>,
    wildcard: Node,
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    param: Option<Box<ParamEdge>>,
    tail: Option<TailEdge>,
    endpoint: Option<Arc<Endpoint>>,
}

#[derive(Debug)]
struct ParamEdge {
    name: String,
    node: Node,
}

#[derive(Debug)]
struct TailEdge {
    name: String,
    endpoint: Arc<Endpoint>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('/').split('/').filter(|s| !s.is_empty())
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `endpoint` under every method it declares.
    pub fn register(&mut self, endpoint: Arc<Endpoint>) -> Result<(), RouterError> {
        for method in endpoint.methods.clone() {
            let node = if method == WILDCARD_METHOD {
                &mut self.wildcard
            } else {
                self.methods.entry(method.clone()).or_default()
            };
            Self::insert(node, &method, endpoint.clone())?;
        }
        Ok(())
    }

    fn insert(mut node: &mut Node, method: &str, endpoint: Arc<Endpoint>) -> Result<(), RouterError> {
        let path = endpoint.path.clone();
        let segs: Vec<&str> = segments(&path).collect();
        for (i, seg) in segs.iter().enumerate() {
            if let Some(name) = seg.strip_prefix('*') {
                if i != segs.len() - 1 {
                    return Err(RouterError::TailNotLast(path));
                }
                if node.tail.is_some() {
                    return Err(RouterError::Duplicate {
                        method: method.to_string(),
                        path,
                    });
                }
                node.tail = Some(TailEdge {
                    name: name.to_string(),
                    endpoint,
                });
                return Ok(());
            } else if let Some(name) = seg.strip_prefix(':') {
                let edge = node.param.get_or_insert_with(|| {
                    Box::new(ParamEdge {
                        name: name.to_string(),
                        node: Node::default(),
                    })
                });
                if edge.name != name {
                    return Err(RouterError::ParamConflict {
                        path: path.clone(),
                        existing: edge.name.clone(),
                        new: name.to_string(),
                    });
                }
                node = &mut edge.node;
            } else {
                node = node.children.entry(seg.to_string()).or_default();
            }
        }
        if node.endpoint.is_some() {
            return Err(RouterError::Duplicate {
                method: method.to_string(),
                path,
            });
        }
        node.endpoint = Some(endpoint);
        Ok(())
    }

    /// Finds the endpoint for `(method, path)` and its captured path
    /// parameters, in route order.
    pub fn lookup(&self, method: &str, path: &str) -> Option<(Arc<Endpoint>, Vec<(String, String)>)> {
        let method = method.to_ascii_uppercase();
        let segs: Vec<&str> = segments(path).collect();
        if let Some(node) = self.methods.get(&method) {
            if let Some(hit) = Self::walk(node, &segs) {
                return Some(hit);
            }
        }
        Self::walk(&self.wildcard, &segs)
    }

    fn walk(node: &Node, segs: &[&str]) -> Option<(Arc<Endpoint>, Vec<(String, String)>)> {
        let mut params = Vec::new();
        Self::walk_inner(node, segs, &mut params)
    }

    fn walk_inner(
        node: &Node,
        segs: &[&str],
        params: &mut Vec<(String, String)>,
    ) -> Option<(Arc<Endpoint>, Vec<(String, String)>)> {
        let Some((seg, rest)) = segs.split_first() else {
            return node.endpoint.clone().map(|ep| (ep, params.clone()));
        };

        if let Some(child) = node.children.get(*seg) {
            if let Some(hit) = Self::walk_inner(child, rest, params) {
                return Some(hit);
            }
        }
        if let Some(edge) = &node.param {
            params.push((edge.name.clone(), seg.to_string()));
            if let Some(hit) = Self::walk_inner(&edge.node, rest, params) {
                return Some(hit);
            }
            params.pop();
        }
        if let Some(tail) = &node.tail {
            let mut params = params.clone();
            params.push((tail.name.clone(), segs.join("/")));
            return Some((tail.endpoint.clone(), params));
        }
        None
    }
}
