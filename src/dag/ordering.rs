use std::cmp::Ordering;

use super::{
    matching::{PathMatch, PrefixKind},
    Route,
};

fn path_rank(path: &PathMatch) -> u8 {
    match path {
        PathMatch::Exact(_) => 0,
        PathMatch::Regex(_) => 1,
        PathMatch::Prefix { .. } => 2,
    }
}

fn prefix_rank(path: &PathMatch) -> u8 {
    match path {
        PathMatch::Prefix { kind: PrefixKind::String, .. } => 1,
        _ => 0,
    }
}

/// Route precedence inside one virtual host.
///
/// The longer path string wins whatever the match kind, and equal lengths fall back to
/// lexicographic order. For the same path string exact matches come first, then regexes,
/// then segment prefixes before string prefixes. After that a route with a method match
/// precedes one without, whatever its header or query predicates, then more header
/// predicates win over fewer, then more query predicates over fewer.
pub fn compare_routes(a: &Route, b: &Route) -> Ordering {
    let (left, right) = (&a.route_match, &b.route_match);
    right
        .path
        .value()
        .len()
        .cmp(&left.path.value().len())
        .then_with(|| left.path.value().cmp(right.path.value()))
        .then_with(|| path_rank(&left.path).cmp(&path_rank(&right.path)))
        .then_with(|| prefix_rank(&left.path).cmp(&prefix_rank(&right.path)))
        .then_with(|| right.method.is_some().cmp(&left.method.is_some()))
        .then_with(|| right.headers.len().cmp(&left.headers.len()))
        .then_with(|| right.queries.len().cmp(&left.queries.len()))
        .then_with(|| left.identity().cmp(&right.identity()))
        .then_with(|| a.origin.key.cmp(&b.origin.key))
}

pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(compare_routes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        matching::{HeaderMatch, RouteMatch},
        test_support::route_with,
    };

    fn paths(routes: &[Route]) -> Vec<String> {
        routes.iter().map(|r| r.route_match.path.value().to_owned()).collect()
    }

    #[test]
    fn longer_prefix_first() {
        let mut routes = vec![
            route_with(RouteMatch::with_path(PathMatch::segment("/foo"))),
            route_with(RouteMatch::with_path(PathMatch::segment("/foo/bar"))),
            route_with(RouteMatch::with_path(PathMatch::root())),
        ];
        sort_routes(&mut routes);
        assert_eq!(paths(&routes), vec!["/foo/bar", "/foo", "/"]);
    }

    #[test]
    fn equal_length_is_lexicographic() {
        let mut routes = vec![
            route_with(RouteMatch::with_path(PathMatch::segment("/bbb"))),
            route_with(RouteMatch::with_path(PathMatch::segment("/aaa"))),
        ];
        sort_routes(&mut routes);
        assert_eq!(paths(&routes), vec!["/aaa", "/bbb"]);
    }

    #[test]
    fn length_wins_over_match_kind() {
        let mut routes = vec![
            route_with(RouteMatch::with_path(PathMatch::Exact("/e".to_owned()))),
            route_with(RouteMatch::with_path(PathMatch::Regex("/r.*".to_owned()))),
            route_with(RouteMatch::with_path(PathMatch::segment("/very/long/prefix"))),
        ];
        sort_routes(&mut routes);
        assert_eq!(paths(&routes), vec!["/very/long/prefix", "/r.*", "/e"]);
    }

    #[test]
    fn same_path_orders_exact_regex_prefix() {
        let mut routes = vec![
            route_with(RouteMatch::with_path(PathMatch::segment("/api"))),
            route_with(RouteMatch::with_path(PathMatch::Regex("/api".to_owned()))),
            route_with(RouteMatch::with_path(PathMatch::Exact("/api".to_owned()))),
        ];
        sort_routes(&mut routes);
        let kinds: Vec<u8> = routes.iter().map(|r| path_rank(&r.route_match.path)).collect();
        assert_eq!(kinds, vec![0, 1, 2]);
    }

    #[test]
    fn method_before_headers() {
        let mut with_headers = RouteMatch::with_path(PathMatch::segment("/api"));
        with_headers.headers.push(HeaderMatch::exact("x-a", "1"));
        with_headers.headers.push(HeaderMatch::exact("x-b", "2"));
        let mut with_method = RouteMatch::with_path(PathMatch::segment("/api"));
        with_method.method = Some("GET".to_owned());
        let plain = RouteMatch::with_path(PathMatch::segment("/api"));

        let mut routes = vec![route_with(plain), route_with(with_headers), route_with(with_method)];
        sort_routes(&mut routes);
        assert!(routes[0].route_match.method.is_some());
        assert_eq!(routes[1].route_match.headers.len(), 2);
        assert!(routes[2].route_match.headers.is_empty());
    }

    #[test]
    fn segment_prefix_before_string_prefix() {
        let mut routes = vec![
            route_with(RouteMatch::with_path(PathMatch::string_prefix("/foo"))),
            route_with(RouteMatch::with_path(PathMatch::segment("/foo"))),
        ];
        sort_routes(&mut routes);
        assert_eq!(routes[0].route_match.path, PathMatch::segment("/foo"));
    }
}
