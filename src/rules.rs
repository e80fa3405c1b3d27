// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use internment::Intern;
use smallvec::SmallVec;

use super::{params_str, Palette};

pub type ParamTypes<T> = BTreeSet<T>;

pub trait TypeId:
  Clone + Copy + Debug + Display + Hash + Eq + Ord + Sized + Send + Sync + 'static
{
  ///
  /// Render a string for a collection of TypeIds.
  ///
  fn display<I>(type_ids: I) -> String
  where
    I: Iterator<Item = Self>;
}

///
/// The stable identity of a declared Rule, distinct from its output type and the shape of its
/// dependencies. Two rules sharing a `RuleId` are assumed by the rest of the graph to be the
/// same rule observed from two call sites; if they disagree about their output type, that is a
/// malformed input and is rejected before construction begins (see `Builder::new`).
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RuleId(Intern<String>);

impl RuleId {
  pub fn new<S: AsRef<str>>(name: S) -> Self {
    RuleId(Intern::new(name.as_ref().to_string()))
  }

  pub fn name(&self) -> &str {
    &self.0
  }
}

impl Debug for RuleId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "RuleId({})", self.0)
  }
}

impl Display for RuleId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

///
/// A key identifying one of a Rule's dependencies: the product (output) type it requests, the
/// set of parameter types it provides into scope for that dependency (for a `Get`; empty for a
/// positional parameter), and an optional restriction to a single named candidate rule (for a
/// "call this rule by name" request rather than "call whichever rule produces this type").
///
#[derive(Eq, Hash, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct DependencyKey<T: TypeId> {
  product: T,
  provided_params: SmallVec<[T; 2]>,
  restrict_to: Option<RuleId>,
}

impl<T: TypeId> DependencyKey<T> {
  pub fn new(product: T) -> Self {
    DependencyKey {
      product,
      provided_params: SmallVec::default(),
      restrict_to: None,
    }
  }

  pub fn for_known_rule(rule_id: RuleId, product: T) -> Self {
    DependencyKey {
      product,
      provided_params: SmallVec::default(),
      restrict_to: Some(rule_id),
    }
  }

  pub fn provided_params<I: IntoIterator<Item = T>>(mut self, provided_params: I) -> Self {
    let mut provided_params = provided_params.into_iter().collect::<SmallVec<[T; 2]>>();
    provided_params.sort();

    if cfg!(debug_assertions) {
      let original_len = provided_params.len();
      provided_params.dedup();
      if original_len != provided_params.len() {
        panic!("Expected unique provided params.");
      }
    }

    self.provided_params = provided_params;
    self
  }

  ///
  /// Returns the product (output) type for this dependency.
  ///
  pub fn product(&self) -> T {
    self.product
  }

  ///
  /// Returns the full set of parameter types this dependency provides into scope.
  ///
  pub fn provided_params_set(&self) -> &[T] {
    &self.provided_params
  }

  ///
  /// Returns a single provided parameter type, if at least one was declared. Kept for the common
  /// single-Get case.
  ///
  pub fn provided_param(&self) -> Option<T> {
    self.provided_params.first().cloned()
  }

  pub fn restrict_to(&self) -> Option<RuleId> {
    self.restrict_to
  }
}

impl<T: TypeId> Display for DependencyKey<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.provided_params.is_empty() {
      write!(f, "{}", self.product)
    } else {
      write!(f, "Get({}, {:?})", self.product, self.provided_params)
    }
  }
}

pub trait DisplayForGraph {
  ///
  /// Return a pretty-printed representation of this Rule's graph node, suitable for graphviz.
  ///
  fn fmt_for_graph(&self, display_args: DisplayForGraphArgs) -> String;
}

///
/// A struct to contain display options consumed by DisplayForGraph.
///
#[derive(Clone, Copy)]
pub struct DisplayForGraphArgs {
  pub multiline: bool,
}

impl DisplayForGraphArgs {
  pub fn line_separator(&self) -> &'static str {
    if self.multiline {
      "\n"
    } else {
      " "
    }
  }

  pub fn optional_line_separator(&self) -> &'static str {
    if self.multiline {
      "\n"
    } else {
      ""
    }
  }
}

pub trait Rule:
  Clone + Debug + Display + Hash + Eq + Sized + DisplayForGraph + Send + Sync + 'static
{
  type TypeId: TypeId;

  ///
  /// Returns the stable identity of this Rule, as distinct from its output type.
  ///
  fn id(&self) -> RuleId;

  ///
  /// Returns the product (output) type for this Rule.
  ///
  fn product(&self) -> Self::TypeId;

  ///
  /// Return keys for the dependencies of this Rule.
  ///
  fn dependency_keys(&self) -> Vec<&DependencyKey<Self::TypeId>>;

  ///
  /// True if this rule implementation should be required to be reachable in the RuleGraph.
  ///
  fn require_reachable(&self) -> bool;

  ///
  /// Return any specific color this rule should be drawn with on the visualized graph. Note that
  /// this coloration setting may be superseded by other factors.
  ///
  fn color(&self) -> Option<Palette>;
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct Query<R: Rule> {
  pub product: R::TypeId,
  pub params: ParamTypes<R::TypeId>,
}

impl<R: Rule> Query<R> {
  pub fn new<I: IntoIterator<Item = R::TypeId>>(product: R::TypeId, params: I) -> Query<R> {
    Query {
      product,
      params: params.into_iter().collect(),
    }
  }
}

impl<R: Rule> Display for Query<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}",
      self.fmt_for_graph(DisplayForGraphArgs { multiline: false })
    )
  }
}

impl<R: Rule> DisplayForGraph for Query<R> {
  fn fmt_for_graph(&self, _: DisplayForGraphArgs) -> String {
    format!("Query({} for {})", self.product, params_str(&self.params))
  }
}
