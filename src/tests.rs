// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;

use indexmap::indexset;

use crate::{
  DependencyKey, DisplayForGraph, DisplayForGraphArgs, FailureKind, Palette, Query, RuleGraph,
  RuleId,
};

///
/// A minimal `Rule` implementation for exercising the graph builder: types are just interned
/// strings, and a rule's identity is the name it was declared with.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct TestRule {
  id: RuleId,
  product: &'static str,
  dependency_keys: Vec<DependencyKey<&'static str>>,
}

impl TestRule {
  fn new(
    product: &'static str,
    name: &'static str,
    dependency_keys: Vec<DependencyKey<&'static str>>,
  ) -> Self {
    TestRule {
      id: RuleId::new(name),
      product,
      dependency_keys,
    }
  }
}

impl crate::Rule for TestRule {
  type TypeId = &'static str;

  fn id(&self) -> RuleId {
    self.id
  }

  fn product(&self) -> &'static str {
    self.product
  }

  fn dependency_keys(&self) -> Vec<&DependencyKey<&'static str>> {
    self.dependency_keys.iter().collect()
  }

  fn require_reachable(&self) -> bool {
    true
  }

  fn color(&self) -> Option<Palette> {
    None
  }
}

impl fmt::Display for TestRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}() -> {}", self.id, self.product)
  }
}

impl DisplayForGraph for TestRule {
  fn fmt_for_graph(&self, _: DisplayForGraphArgs) -> String {
    format!("{}() -> {}", self.id, self.product)
  }
}

impl crate::TypeId for &'static str {
  fn display<I>(type_ids: I) -> String
  where
    I: Iterator<Item = Self>,
  {
    let mut rendered: Vec<_> = type_ids.collect();
    rendered.sort_unstable();
    rendered.join("+")
  }
}

fn assert_failure_kind(rules: Vec<TestRule>, queries: Vec<Query<TestRule>>, kind: FailureKind) {
  let err = RuleGraph::new(rules.into_iter().collect(), queries.into_iter().collect())
    .err()
    .unwrap();
  assert!(
    err.contains(&kind.to_string()),
    "expected the error to mention `{kind}`, but got: {err}"
  );
}

#[test]
fn trivial() {
  let rules = indexset![TestRule::new("a", "a_from_b", vec![DependencyKey::new("b")])];
  let queries = indexset![Query::new("a", vec!["b"])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec!["b"], "a").unwrap();
}

#[test]
fn singleton() {
  let rules = indexset![TestRule::new("a", "a_singleton", vec![])];
  let queries = indexset![Query::new("a", vec![])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec![], "a").unwrap();
}

#[test]
fn no_rules() {
  let rules: Vec<TestRule> = vec![];
  let queries = vec![Query::new("a", vec![])];
  assert_failure_kind(rules, queries, FailureKind::NoCandidate);
}

#[test]
fn missing_candidate() {
  // `a_from_b` needs `b`, but nothing produces it and it isn't a declared parameter.
  let rules = vec![TestRule::new("a", "a_from_b", vec![DependencyKey::new("b")])];
  let queries = vec![Query::new("a", vec![])];
  assert_failure_kind(rules, queries, FailureKind::NoCandidate);
}

#[test]
fn duplicate_rule_id_with_different_product_is_rejected() {
  let rules = indexset![
    TestRule::new("a", "shared_name", vec![]),
    TestRule::new("b", "shared_name", vec![]),
  ];
  let queries = indexset![Query::new("a", vec![])];
  let err = RuleGraph::new(rules, queries).err().unwrap();
  assert!(err.contains("shared_name"));
  assert!(err.contains("two different output types"));
}

#[test]
fn get_chain() {
  // `a_from_b` performs a `Get(b, provided=[c])`; `b_from_c` consumes `c` to produce `b`.
  let rules = indexset![
    TestRule::new(
      "a",
      "a_from_b",
      vec![DependencyKey::new("b").provided_params(vec!["c"])]
    ),
    TestRule::new("b", "b_from_c", vec![DependencyKey::new("c")]),
  ];
  let queries = indexset![Query::new("a", vec!["c"])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec!["c"], "a").unwrap();
}

#[test]
fn by_name() {
  // `a_from_b` restricts its request for `b` to the `b_from_c` rule specifically, even though
  // `b_from_d` also produces `b`.
  let rules = indexset![
    TestRule::new(
      "a",
      "a_from_b",
      vec![DependencyKey::for_known_rule(
        RuleId::new("b_from_c"),
        "b"
      )]
    ),
    TestRule::new("b", "b_from_c", vec![DependencyKey::new("c")]),
    TestRule::new("b", "b_from_d", vec![DependencyKey::new("d")]),
  ];
  let queries = indexset![Query::new("a", vec!["c", "d"])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec!["c", "d"], "a").unwrap();
}

#[test]
fn multiple_provided() {
  // A single `Get` can provide more than one parameter type at once.
  let rules = indexset![
    TestRule::new(
      "a",
      "a_from_b",
      vec![DependencyKey::new("b").provided_params(vec!["c", "d"])]
    ),
    TestRule::new(
      "b",
      "b_from_c_and_d",
      vec![DependencyKey::new("c"), DependencyKey::new("d")],
    ),
  ];
  let queries = indexset![Query::new("a", vec![])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec![], "a").unwrap();
}

#[test]
fn ambiguous() {
  let rules = indexset![
    TestRule::new("a", "a_from_b", vec![DependencyKey::new("b")]),
    TestRule::new("a", "a_from_c", vec![DependencyKey::new("c")]),
  ];
  let queries = vec![Query::new("a", vec!["b", "c"])];
  assert_failure_kind(rules.into_iter().collect(), queries, FailureKind::Ambiguous);
}

#[test]
fn provided_parameter_unused() {
  // `a_from_b` performs `Get(b, provided=[c])`, but `b_from_nothing` never consumes `c`.
  let rules = vec![
    TestRule::new(
      "a",
      "a_from_b",
      vec![DependencyKey::new("b").provided_params(vec!["c"])],
    ),
    TestRule::new("b", "b_from_nothing", vec![]),
  ];
  let queries = vec![Query::new("a", vec![])];
  assert_failure_kind(rules, queries, FailureKind::ProvidedParameterUnused);
}

#[test]
fn provided_parameter_partially_unused() {
  // `a_from_b` provides both `c` and `d` via its `Get`, but `b_from_c` only ever consumes `c`:
  // `d` goes unused, which is illegal even though `c` is consumed.
  let rules = vec![
    TestRule::new(
      "a",
      "a_from_b",
      vec![DependencyKey::new("b").provided_params(vec!["c", "d"])],
    ),
    TestRule::new("b", "b_from_c", vec![DependencyKey::new("c")]),
  ];
  let queries = vec![Query::new("a", vec![])];
  assert_failure_kind(rules, queries, FailureKind::ProvidedParameterUnused);
}

#[test]
fn missing_candidate_is_reported_exactly_once() {
  // `a_from_b` needs `b`, which nothing produces; the query root also fails to compute `a` as a
  // consequence, but that's a derivative failure and should not be reported as its own
  // `NoCandidate` diagnostic alongside the real one.
  let rules = vec![TestRule::new("a", "a_from_b", vec![DependencyKey::new("b")])];
  let queries = vec![Query::new("a", vec![])];
  let err = RuleGraph::new(rules.into_iter().collect(), queries.into_iter().collect())
    .err()
    .unwrap();
  assert_eq!(
    err.matches(&FailureKind::NoCandidate.to_string()).count(),
    1,
    "expected exactly one no_candidate diagnostic, got: {err}"
  );
}

#[test]
fn parameter_consumed_positionally_conflict() {
  // `a_from_b` both positionally consumes `c` and separately requests it via a `Get`: illegal.
  let rules = vec![TestRule::new(
    "a",
    "a_from_b",
    vec![
      DependencyKey::new("c"),
      DependencyKey::new("b").provided_params(vec!["c"]),
    ],
  )];
  let queries = vec![Query::new("a", vec!["c"])];
  assert_failure_kind(rules, queries, FailureKind::ParameterConsumedPositionally);
}

#[test]
fn monomorphization_picks_the_satisfiable_implementation() {
  // Two implementations of `b` exist; only `b_from_c`'s requirement (`c`) is ever in scope, so
  // monomorphization should settle on it and leave `b_from_d` unreachable rather than erroring.
  let rules = indexset![
    TestRule::new(
      "a",
      "a_from_b",
      vec![DependencyKey::new("b").provided_params(vec!["c"])]
    ),
    TestRule::new("b", "b_from_c", vec![DependencyKey::new("c")]),
    TestRule::new("b", "b_from_d", vec![DependencyKey::new("d")]),
  ];
  let queries = indexset![Query::new("a", vec![])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().err().unwrap();
  graph.find_root_edges(vec![], "a").unwrap();
}

#[test]
fn self_cycle() {
  let rules = indexset![TestRule::new(
    "Fib",
    "fib",
    vec![
      DependencyKey::new("int"),
      DependencyKey::new("Fib").provided_params(vec!["int"]),
    ],
  )];
  let queries = indexset![Query::new("Fib", vec!["int"])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec!["int"], "Fib").unwrap();
}

#[test]
fn mutual_recursion() {
  let rules = indexset![
    TestRule::new(
      "IsEven",
      "is_even",
      vec![
        DependencyKey::new("int"),
        DependencyKey::new("IsOdd").provided_params(vec!["int"]),
      ],
    ),
    TestRule::new(
      "IsOdd",
      "is_odd",
      vec![
        DependencyKey::new("int"),
        DependencyKey::new("IsEven").provided_params(vec!["int"]),
      ],
    ),
  ];
  let queries = indexset![
    Query::new("IsEven", vec!["int"]),
    Query::new("IsOdd", vec!["int"]),
  ];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec!["int"], "IsEven").unwrap();
  graph.find_root_edges(vec!["int"], "IsOdd").unwrap();
}

#[test]
fn multi_path_cycle() {
  let _logger = env_logger::try_init();
  let rules = indexset![
    TestRule::new(
      "A",
      "sao",
      vec![
        DependencyKey::new("AWO").provided_params(vec!["AS"]),
        DependencyKey::new("AWO").provided_params(vec!["FS"]),
      ],
    ),
    TestRule::new("AWO", "awofs", vec![DependencyKey::new("FS")]),
    TestRule::new(
      "AWO",
      "awoas",
      vec![DependencyKey::new("AS"), DependencyKey::new("A")],
    ),
  ];
  let queries = indexset![Query::new("A", vec![])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  graph.validate_reachability().unwrap();
  graph.find_root_edges(vec![], "A").unwrap();
}

#[test]
fn unreachable_rule_is_reported() {
  let rules = indexset![
    TestRule::new("a", "a_from_b", vec![DependencyKey::new("b")]),
    TestRule::new("unused", "never_called", vec![]),
  ];
  let queries = indexset![Query::new("a", vec!["b"])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  let err = graph.validate_reachability().err().unwrap();
  assert!(err.contains("never_called"));
}

#[test]
fn find_root_reports_candidates_on_miss() {
  let rules = indexset![TestRule::new("a", "a_from_b", vec![DependencyKey::new("b")])];
  let queries = indexset![Query::new("a", vec!["b"])];
  let graph = RuleGraph::new(rules, queries).unwrap();

  let err = graph.find_root_edges(vec![], "a").err().unwrap();
  assert!(err.contains("a"));
}
