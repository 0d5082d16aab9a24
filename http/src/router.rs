//! Prefix-tree router with static, named-parameter and wildcard edges.
//!
//! Registration-time conflicts are errors; lookup walks the tree with
//! strict static > parameter > wildcard priority and never backtracks
//! between priorities, keeping it O(|segments|). The tree is immutable
//! after startup, so lookups are lock-free and concurrent.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::framework::HandlerError;
use crate::request::Method;

pub type Handler = Arc<dyn Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync>;

/// Captured path parameters (named parameters and the wildcard tail).
pub type PathParams = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("conflicting parameter names :{existing} and :{new} at the same level")]
    ParamConflict { existing: String, new: String },
    #[error("wildcard segment must be the last segment of the path")]
    WildcardPosition,
    #[error("a handler is already registered for {method} {path}")]
    DuplicateHandler { method: Method, path: String },
}

/// Outcome of a lookup.
pub enum RouteResult {
    Found {
        handler: Handler,
        params: PathParams,
    },
    /// No matching path, or a matching node with no handlers at all.
    NotFoundUrl,
    /// Path matched but nothing is registered under this method.
    NotFoundMethod,
}

#[derive(Default)]
struct Node {
    static_children: HashMap<String, Box<Node>>,
    param_child: Option<Box<Node>>,
    wildcard_child: Option<Box<Node>>,
    /// Bound name for parameter/wildcard nodes.
    param_name: String,
    handlers: HashMap<Method, Handler>,
}

#[derive(Default)]
pub struct Router {
    root: Node,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Register `handler` for `method` on `path`.
    ///
    /// Segment classification by first character: `:` introduces a named
    /// parameter (at most one per level, names must agree), `*` a wildcard
    /// (at most one per level, last segment only); anything else is a
    /// literal segment.
    pub fn add_route(
        &mut self,
        path: &str,
        method: Method,
        handler: Handler,
    ) -> Result<(), RouterError> {
        let segments = split_path(path);
        let mut node = &mut self.root;

        for (i, segment) in segments.iter().enumerate() {
            if let Some(name) = segment.strip_prefix(':') {
                match &node.param_child {
                    None => {
                        let mut child = Box::new(Node::default());
                        child.param_name = name.to_string();
                        node.param_child = Some(child);
                    }
                    Some(existing) if existing.param_name != name => {
                        return Err(RouterError::ParamConflict {
                            existing: existing.param_name.clone(),
                            new: name.to_string(),
                        });
                    }
                    Some(_) => {}
                }
                node = node.param_child.as_mut().unwrap();
            } else if let Some(name) = segment.strip_prefix('*') {
                if i != segments.len() - 1 {
                    return Err(RouterError::WildcardPosition);
                }
                if node.wildcard_child.is_none() {
                    let mut child = Box::new(Node::default());
                    child.param_name = name.to_string();
                    node.wildcard_child = Some(child);
                }
                node = node.wildcard_child.as_mut().unwrap();
            } else {
                node = node
                    .static_children
                    .entry(segment.to_string())
                    .or_insert_with(|| Box::new(Node::default()));
            }
        }

        if node.handlers.contains_key(&method) {
            return Err(RouterError::DuplicateHandler {
                method,
                path: path.to_string(),
            });
        }
        node.handlers.insert(method, handler);
        Ok(())
    }

    /// Resolve `path` + `method`.
    ///
    /// A wildcard match binds the rest of the unconsumed path (joined by
    /// `/`) and short-circuits the walk.
    pub fn find_route(&self, path: &str, method: Method) -> RouteResult {
        let segments = split_path(path);
        let mut params = PathParams::new();
        let mut node = &self.root;

        for (i, segment) in segments.iter().enumerate() {
            if let Some(child) = node.static_children.get(*segment) {
                node = child;
                continue;
            }
            if let Some(child) = &node.param_child {
                params.insert(child.param_name.clone(), segment.to_string());
                node = child;
                continue;
            }
            if let Some(child) = &node.wildcard_child {
                params.insert(child.param_name.clone(), segments[i..].join("/"));
                node = child;
                break;
            }
            return RouteResult::NotFoundUrl;
        }

        if node.handlers.is_empty() {
            return RouteResult::NotFoundUrl;
        }
        match node.handlers.get(&method) {
            Some(handler) => RouteResult::Found {
                handler: handler.clone(),
                params,
            },
            None => RouteResult::NotFoundMethod,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_| Ok(()))
    }

    fn tagged(tag: &'static str) -> Handler {
        Arc::new(move |ctx| {
            ctx.response().set_body(tag);
            Ok(())
        })
    }

    fn body_of(result: RouteResult) -> (String, PathParams) {
        match result {
            RouteResult::Found { handler, params } => {
                let req = crate::request::HttpRequest::new();
                let mut resp = crate::response::HttpResponse::new(false);
                let mut ctx = Context::new(&req, &mut resp, params.clone());
                handler(&mut ctx).unwrap();
                (String::from_utf8_lossy(resp.body()).into_owned(), params)
            }
            _ => panic!("expected Found"),
        }
    }

    #[test]
    fn test_priority_static_param_wildcard() {
        let mut router = Router::new();
        router
            .add_route("/x/static", Method::Get, tagged("static"))
            .unwrap();
        router.add_route("/x/:p", Method::Get, tagged("param")).unwrap();
        router
            .add_route("/x/*rest", Method::Get, tagged("wild"))
            .unwrap();

        let (body, _) = body_of(router.find_route("/x/static", Method::Get));
        assert_eq!(body, "static");

        let (body, params) = body_of(router.find_route("/x/foo", Method::Get));
        assert_eq!(body, "param");
        assert_eq!(params.get("p").map(String::as_str), Some("foo"));

        let (body, params) = body_of(router.find_route("/x/a/b/c", Method::Get));
        assert_eq!(body, "wild");
        assert_eq!(params.get("rest").map(String::as_str), Some("a/b/c"));
    }

    #[test]
    fn test_not_found_url_vs_method() {
        let mut router = Router::new();
        router.add_route("/x", Method::Get, noop()).unwrap();

        assert!(matches!(
            router.find_route("/x", Method::Post),
            RouteResult::NotFoundMethod
        ));
        assert!(matches!(
            router.find_route("/y", Method::Get),
            RouteResult::NotFoundUrl
        ));
        // Intermediate node with no handlers of its own.
        router.add_route("/a/b/c", Method::Get, noop()).unwrap();
        assert!(matches!(
            router.find_route("/a/b", Method::Get),
            RouteResult::NotFoundUrl
        ));
    }

    #[test]
    fn test_param_name_conflict() {
        let mut router = Router::new();
        router.add_route("/users/:id", Method::Get, noop()).unwrap();
        // Same name at the same level is fine.
        router.add_route("/users/:id", Method::Post, noop()).unwrap();
        assert_eq!(
            router.add_route("/users/:name", Method::Put, noop()),
            Err(RouterError::ParamConflict {
                existing: "id".to_string(),
                new: "name".to_string(),
            })
        );
    }

    #[test]
    fn test_wildcard_must_be_last() {
        let mut router = Router::new();
        assert_eq!(
            router.add_route("/files/*rest/meta", Method::Get, noop()),
            Err(RouterError::WildcardPosition)
        );
    }

    #[test]
    fn test_duplicate_handler_conflict() {
        let mut router = Router::new();
        router.add_route("/x", Method::Get, noop()).unwrap();
        assert!(matches!(
            router.add_route("/x", Method::Get, noop()),
            Err(RouterError::DuplicateHandler { .. })
        ));
    }

    #[test]
    fn test_no_backtracking_after_param_branch() {
        let mut router = Router::new();
        router.add_route("/x/:p/leaf", Method::Get, noop()).unwrap();
        router.add_route("/x/*rest", Method::Get, noop()).unwrap();

        // "/x/a/other": the walk enters the :p branch at level 2 and
        // dead-ends at level 3; the sibling wildcard is not retried.
        assert!(matches!(
            router.find_route("/x/a/other", Method::Get),
            RouteResult::NotFoundUrl
        ));
    }

    #[test]
    fn test_registration_order_does_not_matter() {
        for flipped in [false, true] {
            let mut router = Router::new();
            let routes: [(&str, Handler); 2] =
                [("/x/:p", tagged("param")), ("/x/static", tagged("static"))];
            let order: Vec<usize> = if flipped { vec![1, 0] } else { vec![0, 1] };
            for idx in order {
                let (path, handler) = &routes[idx];
                router.add_route(path, Method::Get, handler.clone()).unwrap();
            }
            let (body, _) = body_of(router.find_route("/x/static", Method::Get));
            assert_eq!(body, "static");
            let (body, _) = body_of(router.find_route("/x/zzz", Method::Get));
            assert_eq!(body, "param");
        }
    }

    #[test]
    fn test_root_path() {
        let mut router = Router::new();
        router.add_route("/", Method::Get, tagged("root")).unwrap();
        let (body, _) = body_of(router.find_route("/", Method::Get));
        assert_eq!(body, "root");
    }
}
