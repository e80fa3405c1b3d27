// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Display};

use crate::rules::{DependencyKey, ParamTypes, Rule, RuleId};

///
/// The closed set of ways that rule graph construction can fail. Every diagnostic emitted by the
/// builder is tagged with exactly one of these, so that callers (and tests) can match on the
/// reason rather than parsing prose.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureKind {
  /// No rule produces the requested type, and it is not present in the available parameters.
  NoCandidate,
  /// A candidate would require a parameter that is not in scope at the call site.
  ParameterNotInScope,
  /// A rule both positionally consumes a type and separately provides it via a `Get`.
  ParameterConsumedPositionally,
  /// A `Get` provides a parameter that nothing in its subgraph consumes.
  ProvidedParameterUnused,
  /// More than one candidate survives for the same dependency key under the same params.
  Ambiguous,
  /// A cycle survived into the finalized graph. Should be unreachable if earlier phases are
  /// correct; retained as a safety net.
  Cycle,
}

impl Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FailureKind::NoCandidate => "no_candidate",
      FailureKind::ParameterNotInScope => "parameter_not_in_scope",
      FailureKind::ParameterConsumedPositionally => "parameter_consumed_positionally",
      FailureKind::ProvidedParameterUnused => "provided_parameter_unused",
      FailureKind::Ambiguous => "ambiguous",
      FailureKind::Cycle => "cycle",
    };
    write!(f, "{s}")
  }
}

///
/// A single diagnostic record: which rule (or query) was involved, which dependency key (if any),
/// what kind of failure occurred, and a pre-rendered human-readable explanation.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Diagnostic<R: Rule> {
  pub rule_id: Option<RuleId>,
  pub params: ParamTypes<R::TypeId>,
  pub dependency_key: Option<DependencyKey<R::TypeId>>,
  pub kind: FailureKind,
  pub message: String,
}

impl<R: Rule> Display for Diagnostic<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] {}", self.kind, self.message)
  }
}

///
/// An aggregate, batched failure from rule graph construction. All diagnostics produced by a
/// single `Builder::graph()` call are returned together; partial graphs are never exposed.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RuleGraphError<R: Rule> {
  pub diagnostics: Vec<Diagnostic<R>>,
}

impl<R: Rule> RuleGraphError<R> {
  pub fn new(diagnostics: Vec<Diagnostic<R>>) -> Self {
    RuleGraphError { diagnostics }
  }
}

impl<R: Rule> Display for RuleGraphError<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "Encountered {} rule graph error{}:",
      self.diagnostics.len(),
      if self.diagnostics.len() == 1 { "" } else { "s" }
    )?;
    for diagnostic in &self.diagnostics {
      writeln!(f, "  {diagnostic}")?;
    }
    Ok(())
  }
}
