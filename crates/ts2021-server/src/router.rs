//! Route table for requests arriving over the Noise channel.

use http::Method;

pub const REGISTER_PATH: &str = "/machine/register";
pub const MAP_PATH: &str = "/machine/map";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Register,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Methods {
    PostOnly,
    Any,
}

impl Methods {
    fn allows(self, method: &Method) -> bool {
        match self {
            Methods::PostOnly => method == Method::POST,
            Methods::Any => true,
        }
    }
}

struct RouteEntry {
    path: &'static str,
    methods: Methods,
    route: Route,
}

const ROUTES: &[RouteEntry] = &[
    RouteEntry {
        path: REGISTER_PATH,
        methods: Methods::PostOnly,
        route: Route::Register,
    },
    // Clients issue map requests with more than one method.
    RouteEntry {
        path: MAP_PATH,
        methods: Methods::Any,
        route: Route::Map,
    },
];

/// Outcome of matching a request against the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Matched(Route),
    MethodNotAllowed,
    NotFound,
}

/// Match on exact path, then method.
pub fn resolve(method: &Method, path: &str) -> Resolution {
    match ROUTES.iter().find(|entry| entry.path == path) {
        Some(entry) if entry.methods.allows(method) => Resolution::Matched(entry.route),
        Some(_) => Resolution::MethodNotAllowed,
        None => Resolution::NotFound,
    }
}
