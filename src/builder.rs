// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use std::collections::{hash_map, BTreeSet, HashMap, HashSet};

use fnv::FnvHashMap;
use indexmap::IndexSet;
use internment::Intern;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::diagnostics::{Diagnostic, FailureKind, RuleGraphError};
use crate::rules::{DependencyKey, ParamTypes, Query, Rule, RuleId};
use crate::{params_str, Entry, EntryWithDeps, RootEntry, RuleEdges, RuleEntry, RuleGraph};

///
/// A builder-local stand-in for `crate::Entry` that is not yet interned: intermediate phases
/// move these around by value, and only the finalization phase (`finalize`) commits surviving
/// nodes to the `internment::Intern` arena that the public `RuleGraph` is built from.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum BEntry<R: Rule> {
  Param(R::TypeId),
  WithDeps(EntryWithDeps<R>),
}

impl<R: Rule> BEntry<R> {
  fn params(&self) -> ParamTypes<R::TypeId> {
    match self {
      BEntry::Param(p) => std::iter::once(*p).collect(),
      BEntry::WithDeps(e) => e.params().clone(),
    }
  }
}

///
/// A polymorphic form of RuleEdges: each dependency key may still have multiple candidate
/// sources, because polymorphic construction has not yet committed to one.
///
#[derive(Clone, Debug, Eq, PartialEq)]
struct PolyRuleEdges<R: Rule> {
  dependencies: FnvHashMap<DependencyKey<R::TypeId>, Vec<BEntry<R>>>,
}

impl<R: Rule> Default for PolyRuleEdges<R> {
  fn default() -> Self {
    PolyRuleEdges {
      dependencies: FnvHashMap::default(),
    }
  }
}

///
/// The builder-local analog of `crate::RuleEdges`, holding not-yet-interned targets.
///
#[derive(Clone, Debug, Eq, PartialEq)]
struct BRuleEdges<R: Rule> {
  dependencies: FnvHashMap<DependencyKey<R::TypeId>, BEntry<R>>,
}

impl<R: Rule> BRuleEdges<R> {
  fn add_edge(&mut self, key: DependencyKey<R::TypeId>, target: BEntry<R>) {
    self.dependencies.insert(key, target);
  }
}

impl<R: Rule> Default for BRuleEdges<R> {
  fn default() -> Self {
    BRuleEdges {
      dependencies: FnvHashMap::default(),
    }
  }
}

type ChosenDependency<R> = (DependencyKey<<R as Rule>::TypeId>, Vec<BEntry<R>>);

enum ConstructGraphResult<R: Rule> {
  /// The Entry was satisfiable without waiting for any additional nodes to be satisfied. The
  /// result contains a simplified copy of the input Entry.
  Fulfilled(EntryWithDeps<R>),
  /// The Entry was not satisfiable with installed rules.
  Unfulfillable,
  /// The dependencies of an Entry might be satisfiable, but is currently blocked waiting for the
  /// results of the given entries. Holds partially-fulfilled entries which do not yet contain
  /// their full set of used parameters; these are only consumed in the case where a caller is
  /// itself the source of the cycle.
  CycledOn {
    cyclic_deps: HashSet<EntryWithDeps<R>>,
    simplified_entry: EntryWithDeps<R>,
  },
}

enum MonomorphizeGraphResult<R: Rule> {
  Fulfilled(Vec<EntryWithDeps<R>>),
  Unfulfillable,
  CycledOn {
    cyclic_deps: HashSet<EntryWithDeps<R>>,
    simplified_entries: Vec<EntryWithDeps<R>>,
  },
}

///
/// Compiles a set of Rule and Query declarations into a `RuleGraph`: a monomorphic dependency
/// graph suitable for use as a memoization schema. See `SPEC_FULL.md` for the five-phase
/// pipeline this implements.
///
pub struct Builder<R: Rule> {
  rules: IndexSet<R>,
  queries: IndexSet<Query<R>>,
  tasks: FnvHashMap<R::TypeId, Vec<R>>,
  /// Rules whose own dependency_keys both positionally consume and separately `Get`-provide the
  /// same type: illegal per `parameter_consumed_positionally`, computed once up front since the
  /// check is local to a single rule declaration and needs no graph traversal.
  positional_conflicts: FnvHashMap<RuleId, R::TypeId>,
}

impl<R: Rule> Builder<R> {
  pub fn new(rules: IndexSet<R>, queries: IndexSet<Query<R>>) -> Result<Builder<R>, String> {
    // Input validation: a RuleId must uniquely determine a product type.
    let mut ids: HashMap<RuleId, R::TypeId> = HashMap::new();
    for rule in &rules {
      let id = rule.id();
      let product = rule.product();
      if let Some(existing_product) = ids.get(&id) {
        if *existing_product != product {
          return Err(format!(
            "Rule id {id} is registered with two different output types: {existing_product} and {product}",
          ));
        }
      } else {
        ids.insert(id, product);
      }
    }

    let mut tasks: FnvHashMap<R::TypeId, Vec<R>> = FnvHashMap::default();
    for rule in &rules {
      tasks.entry(rule.product()).or_default().push(rule.clone());
    }

    let positional_conflicts = rules
      .iter()
      .filter_map(|rule| positional_conflict(rule).map(|product| (rule.id(), product)))
      .collect();

    Ok(Builder {
      rules,
      queries,
      tasks,
      positional_conflicts,
    })
  }

  ///
  /// Runs the full five-phase pipeline, returning either the finalized graph or the batch of
  /// diagnostics that explain why it could not be constructed.
  ///
  pub fn graph(&self) -> Result<RuleGraph<R>, RuleGraphError<R>> {
    log::trace!("rule_graph: beginning polymorphic construction");
    let mut poly_edges: HashMap<EntryWithDeps<R>, PolyRuleEdges<R>> = HashMap::new();
    let mut all_simplified_entries: HashMap<EntryWithDeps<R>, EntryWithDeps<R>> = HashMap::new();
    let mut unfulfillable_rules: HashMap<EntryWithDeps<R>, Vec<Diagnostic<R>>> = HashMap::new();

    for query in &self.queries {
      let root = EntryWithDeps::Root(RootEntry(query.clone()));
      self.construct_graph_helper(
        &mut poly_edges,
        &mut all_simplified_entries,
        &mut unfulfillable_rules,
        &root,
      );
    }
    log::trace!(
      "rule_graph: polymorphic construction produced {} nodes ({} unfulfillable)",
      poly_edges.len(),
      unfulfillable_rules.len()
    );

    log::trace!("rule_graph: beginning monomorphization");
    let (rule_dependency_edges, ambiguities) =
      Self::monomorphize_graph(&poly_edges, &mut unfulfillable_rules);
    log::trace!(
      "rule_graph: monomorphization produced {} nodes",
      rule_dependency_edges.len()
    );

    // `unfulfillable_rules` and `ambiguities` also accumulate noise from candidates that were
    // tried and rejected in favor of a sibling that did pan out: an alternate implementation of
    // a product that never ends up reachable is not itself a failure. Only surface diagnostics
    // when a declared query's own root entry failed to monomorphize.
    let all_queries_satisfied = self.queries.iter().all(|query| {
      let root = EntryWithDeps::Root(RootEntry(query.clone()));
      rule_dependency_edges.contains_key(&root)
    });

    if all_queries_satisfied {
      log::trace!("rule_graph: beginning finalization");
      return self.finalize(rule_dependency_edges);
    }

    let mut diagnostics: Vec<Diagnostic<R>> = unfulfillable_rules
      .into_values()
      .flatten()
      .chain(ambiguities)
      .collect();
    diagnostics.sort_by(|a, b| a.message.cmp(&b.message));
    Err(RuleGraphError::new(diagnostics))
  }

  ///
  /// Computes whether the given candidate Entry is satisfiable, and if so, returns a simplified
  /// copy of it with a minimal conservative in-set. Memoizes results in `all_simplified_entries`.
  ///
  fn construct_graph_helper(
    &self,
    poly_edges: &mut HashMap<EntryWithDeps<R>, PolyRuleEdges<R>>,
    all_simplified_entries: &mut HashMap<EntryWithDeps<R>, EntryWithDeps<R>>,
    unfulfillable_rules: &mut HashMap<EntryWithDeps<R>, Vec<Diagnostic<R>>>,
    entry: &EntryWithDeps<R>,
  ) -> ConstructGraphResult<R> {
    if let Some(simplified) = all_simplified_entries.get(entry) {
      return ConstructGraphResult::Fulfilled(simplified.clone());
    } else if unfulfillable_rules.contains_key(entry) {
      return ConstructGraphResult::Unfulfillable;
    }

    if let EntryWithDeps::Rule(RuleEntry { rule, .. }) = entry {
      if let Some(conflicting_type) = self.positional_conflicts.get(&rule.id()) {
        log::debug!(
          "rule_graph: rejecting {}: {} is both positionally consumed and separately provided",
          rule,
          conflicting_type
        );
        unfulfillable_rules.insert(
          entry.clone(),
          vec![Diagnostic {
            rule_id: Some(rule.id()),
            params: entry.params().clone(),
            dependency_key: None,
            kind: FailureKind::ParameterConsumedPositionally,
            message: format!(
              "{rule} both positionally consumes {conflicting_type} and separately requests it via a Get: a rule may not play both roles for the same type.",
            ),
          }],
        );
        return ConstructGraphResult::Unfulfillable;
      }
    }

    // Insert a placeholder to detect self-recursion: a rule may legally depend (transitively) on
    // itself, as long as some monomorph of it can still be satisfied.
    match poly_edges.entry(entry.clone()) {
      hash_map::Entry::Vacant(e) => {
        e.insert(PolyRuleEdges::default());
      }
      hash_map::Entry::Occupied(_) => {
        let mut cyclic_deps = HashSet::new();
        cyclic_deps.insert(entry.clone());
        return ConstructGraphResult::CycledOn {
          cyclic_deps,
          simplified_entry: entry.simplified(BTreeSet::new()),
        };
      }
    }

    // This is a loop because discovering that this entry needs to complete in order to break a
    // cycle on itself means we must re-derive its dependencies, now that the cyclic dependency
    // has a simplified representation to recurse onto.
    loop {
      if let Ok(res) =
        self.construct_dependencies(poly_edges, all_simplified_entries, unfulfillable_rules, entry)
      {
        break res;
      }
    }
  }

  fn construct_dependencies(
    &self,
    poly_edges: &mut HashMap<EntryWithDeps<R>, PolyRuleEdges<R>>,
    all_simplified_entries: &mut HashMap<EntryWithDeps<R>, EntryWithDeps<R>>,
    unfulfillable_rules: &mut HashMap<EntryWithDeps<R>, Vec<Diagnostic<R>>>,
    entry: &EntryWithDeps<R>,
  ) -> Result<ConstructGraphResult<R>, ()> {
    let mut fulfillable_candidates_by_key = FnvHashMap::default();
    let mut cycled_on = HashSet::new();
    let mut unfulfillable_diagnostics = Vec::new();
    let mut any_unfulfillable_key = false;

    for dependency_key in self.dependency_keys_for(entry) {
      let mut params = entry.params().clone();
      params.extend(dependency_key.provided_params_set().iter().cloned());

      let mut cycled = false;
      let raw_candidates = self.rhs(&params, &dependency_key);
      let had_raw_candidates = !raw_candidates.is_empty();
      let fulfillable_candidates = fulfillable_candidates_by_key
        .entry(dependency_key.clone())
        .or_insert_with(Vec::new);
      for candidate in raw_candidates {
        match candidate {
          BEntry::WithDeps(c) => {
            match self.construct_graph_helper(poly_edges, all_simplified_entries, unfulfillable_rules, &c)
            {
              ConstructGraphResult::Unfulfillable => {}
              ConstructGraphResult::Fulfilled(simplified_entry) => {
                fulfillable_candidates.push(BEntry::WithDeps(simplified_entry));
              }
              ConstructGraphResult::CycledOn {
                cyclic_deps,
                simplified_entry,
              } => {
                cycled = true;
                cycled_on.extend(cyclic_deps);
                fulfillable_candidates.push(BEntry::WithDeps(simplified_entry));
              }
            }
          }
          p @ BEntry::Param(_) => fulfillable_candidates.push(p),
        }
      }

      if cycled {
        continue;
      }

      if fulfillable_candidates.is_empty() {
        any_unfulfillable_key = true;
        // A rule for this key did exist but failed transitively: that failure was already
        // diagnosed at the entry that actually lacked a candidate. Re-emitting a `NoCandidate`
        // diagnostic here would be both redundant and wrong, since a candidate plainly exists.
        if !had_raw_candidates {
          unfulfillable_diagnostics.push(no_candidate_diagnostic(entry, &dependency_key, &params));
        }
      }
    }

    if any_unfulfillable_key {
      unfulfillable_rules
        .entry(entry.clone())
        .or_default()
        .extend(unfulfillable_diagnostics);
      poly_edges.remove(entry);
      return Ok(ConstructGraphResult::Unfulfillable);
    }

    let rule_edges = PolyRuleEdges {
      dependencies: fulfillable_candidates_by_key,
    };
    let simplified_entry = {
      let mut all_used_params = BTreeSet::new();
      for (key, inputs) in &rule_edges.dependencies {
        let provided: BTreeSet<_> = key.provided_params_set().iter().cloned().collect();
        for input in inputs {
          all_used_params.extend(input.params().into_iter().filter(|p| !provided.contains(p)));
        }
      }
      entry.simplified(all_used_params)
    };

    poly_edges.remove(entry);
    if cycled_on.is_empty() {
      poly_edges.insert(simplified_entry.clone(), rule_edges);
      all_simplified_entries.insert(entry.clone(), simplified_entry.clone());
      Ok(ConstructGraphResult::Fulfilled(simplified_entry))
    } else {
      cycled_on.remove(entry);
      if cycled_on.is_empty() {
        // We are the top-most cyclic parent on the call stack: store our simplified equivalence
        // and retry, so that our cyclic dependents can now resolve against it.
        all_simplified_entries.insert(entry.clone(), simplified_entry);
        Err(())
      } else {
        Ok(ConstructGraphResult::CycledOn {
          cyclic_deps: cycled_on,
          simplified_entry,
        })
      }
    }
  }

  ///
  /// Given the polymorphic graph, monomorphize it into a graph where each node has exactly one
  /// implementation per dependency key, returning both the monomorphized graph and any ambiguity
  /// diagnostics encountered along the way.
  ///
  fn monomorphize_graph(
    poly_edges: &HashMap<EntryWithDeps<R>, PolyRuleEdges<R>>,
    unfulfillable_rules: &mut HashMap<EntryWithDeps<R>, Vec<Diagnostic<R>>>,
  ) -> (HashMap<EntryWithDeps<R>, BRuleEdges<R>>, Vec<Diagnostic<R>>) {
    let mut rule_dependency_edges = HashMap::new();
    let mut all_monomorphized_entries = HashMap::new();
    let mut ambiguities = Vec::new();
    for entry in poly_edges.keys() {
      if let EntryWithDeps::Root(_) = entry {
        Self::monomorphize_graph_helper(
          entry,
          poly_edges,
          &mut rule_dependency_edges,
          &mut all_monomorphized_entries,
          unfulfillable_rules,
          &mut ambiguities,
        );
      }
    }
    (rule_dependency_edges, ambiguities)
  }

  fn monomorphize_graph_helper(
    entry: &EntryWithDeps<R>,
    poly_edges: &HashMap<EntryWithDeps<R>, PolyRuleEdges<R>>,
    rule_dependency_edges: &mut HashMap<EntryWithDeps<R>, BRuleEdges<R>>,
    all_monomorphized_entries: &mut HashMap<EntryWithDeps<R>, Vec<EntryWithDeps<R>>>,
    unfulfillable_rules: &mut HashMap<EntryWithDeps<R>, Vec<Diagnostic<R>>>,
    ambiguities: &mut Vec<Diagnostic<R>>,
  ) -> MonomorphizeGraphResult<R> {
    if let Some(simplified) = all_monomorphized_entries.get(entry) {
      return MonomorphizeGraphResult::Fulfilled(simplified.clone());
    } else if unfulfillable_rules.contains_key(entry) {
      return MonomorphizeGraphResult::Unfulfillable;
    }

    match rule_dependency_edges.entry(entry.clone()) {
      hash_map::Entry::Vacant(e) => {
        e.insert(BRuleEdges::default());
      }
      hash_map::Entry::Occupied(_) => {
        let mut cyclic_deps = HashSet::new();
        cyclic_deps.insert(entry.clone());
        return MonomorphizeGraphResult::CycledOn {
          cyclic_deps,
          simplified_entries: vec![entry.simplified(BTreeSet::new())],
        };
      }
    }

    loop {
      if let Ok(res) = Self::monomorphize_dependencies(
        entry,
        poly_edges,
        rule_dependency_edges,
        all_monomorphized_entries,
        unfulfillable_rules,
        ambiguities,
      ) {
        break res;
      }
    }
  }

  fn monomorphize_dependencies(
    entry: &EntryWithDeps<R>,
    poly_edges: &HashMap<EntryWithDeps<R>, PolyRuleEdges<R>>,
    rule_dependency_edges: &mut HashMap<EntryWithDeps<R>, BRuleEdges<R>>,
    all_monomorphized_entries: &mut HashMap<EntryWithDeps<R>, Vec<EntryWithDeps<R>>>,
    unfulfillable_rules: &mut HashMap<EntryWithDeps<R>, Vec<Diagnostic<R>>>,
    ambiguities: &mut Vec<Diagnostic<R>>,
  ) -> Result<MonomorphizeGraphResult<R>, ()> {
    let mut monomorphized_candidates_by_key: FnvHashMap<DependencyKey<R::TypeId>, Vec<BEntry<R>>> =
      FnvHashMap::default();
    let mut cycled_on = HashSet::new();
    let mut unfulfillable_diagnostics = Vec::new();
    let mut any_unfulfillable_key = false;

    for (dependency_key, inputs) in poly_edges.get(entry).unwrap().dependencies.clone() {
      let mut cycled = false;
      let had_raw_candidates = !inputs.is_empty();
      let monomorphized_candidates = monomorphized_candidates_by_key
        .entry(dependency_key.clone())
        .or_default();
      for input in inputs {
        match input {
          BEntry::WithDeps(e) => {
            match Self::monomorphize_graph_helper(
              &e,
              poly_edges,
              rule_dependency_edges,
              all_monomorphized_entries,
              unfulfillable_rules,
              ambiguities,
            ) {
              MonomorphizeGraphResult::Unfulfillable => {}
              MonomorphizeGraphResult::Fulfilled(simplified_entries) => {
                monomorphized_candidates.extend(simplified_entries.into_iter().map(BEntry::WithDeps));
              }
              MonomorphizeGraphResult::CycledOn {
                cyclic_deps,
                simplified_entries,
              } => {
                cycled = true;
                cycled_on.extend(cyclic_deps);
                monomorphized_candidates.extend(simplified_entries.into_iter().map(BEntry::WithDeps));
              }
            }
          }
          p @ BEntry::Param(_) => monomorphized_candidates.push(p),
        }
      }

      if cycled {
        continue;
      }

      if monomorphized_candidates.is_empty() {
        any_unfulfillable_key = true;
        // As in `construct_dependencies`: only report a fresh diagnostic when no candidate ever
        // existed for this key. A candidate that failed during monomorphization (whether an
        // ordinary `NoCandidate` further down, or the `ParameterNotInScope` / `ProvidedParameterUnused`
        // /`Ambiguous` diagnostics `choose_dependencies` raises) has already explained itself.
        if !had_raw_candidates {
          let params = entry.params().clone();
          unfulfillable_diagnostics.push(no_candidate_diagnostic(entry, &dependency_key, &params));
        }
      }
    }

    if any_unfulfillable_key {
      unfulfillable_rules
        .entry(entry.clone())
        .or_default()
        .extend(unfulfillable_diagnostics);
      rule_dependency_edges.remove(entry);
      return Ok(MonomorphizeGraphResult::Unfulfillable);
    }

    let monomorphized_candidates: Vec<ChosenDependency<R>> =
      monomorphized_candidates_by_key.into_iter().collect();

    // Collect the powerset of the union of used parameters, ordered by ascending set size, so
    // that the smallest satisfying in-set is always considered first.
    let params_powerset: Vec<Vec<R::TypeId>> = {
      let mut all_used_params = BTreeSet::new();
      for (key, inputs) in &monomorphized_candidates {
        let provided: BTreeSet<_> = key.provided_params_set().iter().cloned().collect();
        for input in inputs {
          all_used_params.extend(input.params().into_iter().filter(|p| !provided.contains(p)));
        }
      }
      let mut param_sets =
        powerset(&all_used_params.into_iter().collect::<Vec<_>>()).collect::<Vec<_>>();
      param_sets.sort_by_key(|s| s.len());
      param_sets
    };

    let mut combinations: HashMap<EntryWithDeps<R>, BRuleEdges<R>> = HashMap::new();
    let mut diagnostics = Vec::new();
    let last_index = params_powerset.len().saturating_sub(1);
    for (i, available_params) in params_powerset.into_iter().enumerate() {
      let available_params: ParamTypes<R::TypeId> = available_params.into_iter().collect();
      if combinations
        .keys()
        .any(|satisfied| satisfied.params().is_subset(&available_params))
      {
        continue;
      }

      match choose_dependencies(
        entry,
        &available_params,
        &monomorphized_candidates,
        i == last_index,
      ) {
        Ok(Some(edges)) => {
          combinations.insert(entry.simplified(available_params), edges);
        }
        Ok(None) => {}
        Err(diagnostic) => diagnostics.push(diagnostic),
      }
    }

    let simplified_entries: Vec<_> = combinations.keys().cloned().collect();

    rule_dependency_edges.remove(entry);
    ambiguities.extend(diagnostics);
    if cycled_on.is_empty() {
      if combinations.is_empty() {
        Ok(MonomorphizeGraphResult::Unfulfillable)
      } else {
        rule_dependency_edges.extend(combinations);
        all_monomorphized_entries.insert(entry.clone(), simplified_entries.clone());
        Ok(MonomorphizeGraphResult::Fulfilled(simplified_entries))
      }
    } else {
      cycled_on.remove(entry);
      if cycled_on.is_empty() {
        all_monomorphized_entries.insert(entry.clone(), simplified_entries);
        Err(())
      } else {
        Ok(MonomorphizeGraphResult::CycledOn {
          cyclic_deps: cycled_on,
          simplified_entries,
        })
      }
    }
  }

  fn dependency_keys_for(&self, entry: &EntryWithDeps<R>) -> Vec<DependencyKey<R::TypeId>> {
    match entry {
      EntryWithDeps::Root(RootEntry(query)) => vec![DependencyKey::new(query.product)],
      EntryWithDeps::Rule(RuleEntry { rule, .. }) => {
        rule.dependency_keys().into_iter().cloned().collect()
      }
    }
  }

  ///
  /// Selects candidates able to provide the given dependency key in the given parameter
  /// environment: the parameter itself, if present, plus every rule (or the one named by
  /// `restrict_to`) producing the key's product type.
  ///
  fn rhs(
    &self,
    params: &ParamTypes<R::TypeId>,
    dependency_key: &DependencyKey<R::TypeId>,
  ) -> Vec<BEntry<R>> {
    let product = dependency_key.product();
    let mut entries = Vec::new();
    if dependency_key.provided_params_set().is_empty() {
      if let Some(type_id) = params.get(&product) {
        entries.push(BEntry::Param(*type_id));
      }
    }
    if let Some(matching_rules) = self.tasks.get(&product) {
      entries.extend(
        matching_rules
          .iter()
          .filter(|rule| {
            dependency_key
              .restrict_to()
              .map(|id| id == rule.id())
              .unwrap_or(true)
          })
          .map(|rule| {
            BEntry::WithDeps(EntryWithDeps::Rule(RuleEntry {
              params: params.clone(),
              rule: rule.clone(),
            }))
          }),
      );
    }
    entries
  }

  ///
  /// Phase 5: projects the validated, monomorphized graph into the public `RuleGraph`, pruning
  /// anything unreachable from a query and running a final acyclicity safety check.
  ///
  fn finalize(
    &self,
    mono_edges: HashMap<EntryWithDeps<R>, BRuleEdges<R>>,
  ) -> Result<RuleGraph<R>, RuleGraphError<R>> {
    let mut visited: HashSet<EntryWithDeps<R>> = HashSet::new();
    let mut rule_dependency_edges: FnvHashMap<Intern<EntryWithDeps<R>>, RuleEdges<R>> =
      FnvHashMap::default();
    let mut stack: Vec<EntryWithDeps<R>> = mono_edges
      .keys()
      .filter(|e| matches!(e, EntryWithDeps::Root(_)))
      .cloned()
      .collect();

    while let Some(entry) = stack.pop() {
      if !visited.insert(entry.clone()) {
        continue;
      }
      let node = Intern::new(entry.clone());
      let Some(b_edges) = mono_edges.get(&entry) else {
        continue;
      };

      let mut final_edges = RuleEdges::default();
      for (key, target) in &b_edges.dependencies {
        let final_target = match target {
          BEntry::Param(p) => Entry::Param(*p),
          BEntry::WithDeps(dep_entry) => {
            stack.push(dep_entry.clone());
            Entry::WithDeps(Intern::new(dep_entry.clone()))
          }
        };
        final_edges.add_edge(key.clone(), final_target);
      }
      rule_dependency_edges.insert(node, final_edges);
    }

    // Safety net: the prior phases' invariants should make a cycle here unreachable. Checked
    // anyway, since silently handing the runtime a cyclic memoization schema would be worse than
    // a (hopefully never reached) hard error.
    if let Some(cycle_diagnostic) = detect_cycle(&rule_dependency_edges) {
      return Err(RuleGraphError::new(vec![cycle_diagnostic]));
    }

    let unreachable_rules = self.unreachable_rules(&rule_dependency_edges);

    let graph = RuleGraph {
      queries: self.queries.iter().cloned().collect(),
      rule_dependency_edges,
      unreachable_rules,
    };
    graph.warn_unused_query_params();
    Ok(graph)
  }

  fn unreachable_rules(
    &self,
    rule_dependency_edges: &FnvHashMap<Intern<EntryWithDeps<R>>, RuleEdges<R>>,
  ) -> Vec<crate::UnreachableError<R>> {
    let mut stack: Vec<_> = rule_dependency_edges
      .keys()
      .filter(|e| matches!(e.as_ref(), EntryWithDeps::Root(_)))
      .cloned()
      .collect();
    let mut visited = HashSet::new();
    while let Some(entry) = stack.pop() {
      if !visited.insert(entry) {
        continue;
      }
      if let Some(edges) = rule_dependency_edges.get(&entry) {
        stack.extend(edges.all_dependencies().filter_map(|e| match e.as_ref() {
          Entry::WithDeps(e) => Some(*e),
          _ => None,
        }));
      }
    }

    let reachable_rules: HashSet<_> = visited
      .into_iter()
      .filter_map(|entry| match entry.as_ref() {
        EntryWithDeps::Rule(RuleEntry { rule, .. }) if rule.require_reachable() => Some(rule.clone()),
        _ => None,
      })
      .collect();

    self
      .rules
      .iter()
      .filter(|r| r.require_reachable() && !reachable_rules.contains(*r))
      .map(|r| crate::UnreachableError::new(r.clone()))
      .collect()
  }
}

///
/// If a rule both positionally consumes a type and also supplies that same type as a provided
/// parameter on one of its own dependency keys, that is a static conflict local to this one rule:
/// no traversal of the rest of the graph is needed to detect it.
///
fn positional_conflict<R: Rule>(rule: &R) -> Option<R::TypeId> {
  let keys = rule.dependency_keys();
  for key in &keys {
    if key.provided_params_set().is_empty() {
      let product = key.product();
      if keys
        .iter()
        .any(|other| other.provided_params_set().contains(&product))
      {
        return Some(product);
      }
    }
  }
  None
}

fn no_candidate_diagnostic<R: Rule>(
  entry: &EntryWithDeps<R>,
  dependency_key: &DependencyKey<R::TypeId>,
  params: &ParamTypes<R::TypeId>,
) -> Diagnostic<R> {
  let message = if params.is_empty() {
    format!("No rule was available to compute {dependency_key}, and it was not present in the parameters.")
  } else {
    format!(
      "No rule was available to compute {} with parameter type{} {}",
      dependency_key,
      if params.len() > 1 { "s" } else { "" },
      params_str(params),
    )
  };
  Diagnostic {
    rule_id: entry.rule().map(|r| r.id()),
    params: params.clone(),
    dependency_key: Some(dependency_key.clone()),
    kind: FailureKind::NoCandidate,
    message,
  }
}

fn entry_label<R: Rule>(entry: &EntryWithDeps<R>) -> String {
  match entry.rule() {
    Some(r) => r.to_string(),
    None => "the query".to_string(),
  }
}

fn ambiguous_diagnostic<R: Rule>(
  entry: &EntryWithDeps<R>,
  key: &DependencyKey<R::TypeId>,
  available_params: &ParamTypes<R::TypeId>,
  chosen: Vec<&BEntry<R>>,
) -> Diagnostic<R> {
  let params_clause = match available_params.len() {
    0 => String::new(),
    1 => format!(" with parameter type {}", params_str(available_params)),
    _ => format!(" with parameter types {}", params_str(available_params)),
  };
  Diagnostic {
    rule_id: entry.rule().map(|r| r.id()),
    params: available_params.clone(),
    dependency_key: Some(key.clone()),
    kind: FailureKind::Ambiguous,
    message: format!(
      "Ambiguous rules to compute {key}{params_clause}:\n  {}",
      chosen
        .into_iter()
        .map(|e| match e {
          BEntry::Param(p) => format!("Param({p})"),
          BEntry::WithDeps(e) => crate::entry_with_deps_str(e),
        })
        .collect::<Vec<_>>()
        .join("\n  "),
    ),
  }
}

///
/// Given a set of available params, choose one satisfiable combination of dependency edges, if
/// one exists for this exact set. A candidate is in scope if its own in-set (other than the
/// parameters this key provides) is covered by `available_params`. Among in-scope candidates for
/// a key that provides parameters, only those that consume every one of them count: a `Get` whose
/// target never reads one of the parameters it was given is an error (`ProvidedParameterUnused`),
/// not silently ignored. More than one surviving candidate for the same key is `Ambiguous`.
///
/// `is_maximal_attempt` marks the call made with the full union of used parameters (the largest
/// set the powerset search will ever try): if no candidate is in scope even then, the dependency
/// key can never be satisfied at this call site regardless of which parameters are in scope
/// higher up, so that failure is reported as `ParameterNotInScope` rather than silently retried.
///
fn choose_dependencies<R: Rule>(
  entry: &EntryWithDeps<R>,
  available_params: &ParamTypes<R::TypeId>,
  deps: &[ChosenDependency<R>],
  is_maximal_attempt: bool,
) -> Result<Option<BRuleEdges<R>>, Diagnostic<R>> {
  let mut combination = BRuleEdges::default();
  for (key, input_entries) in deps {
    let provided: BTreeSet<_> = key.provided_params_set().iter().cloned().collect();

    let scope_satisfiable: Vec<_> = input_entries
      .iter()
      .filter(|input_entry| {
        input_entry
          .params()
          .iter()
          .all(|p| available_params.contains(p) || provided.contains(p))
      })
      .collect();

    if scope_satisfiable.is_empty() {
      if is_maximal_attempt {
        return Err(Diagnostic {
          rule_id: entry.rule().map(|r| r.id()),
          params: available_params.clone(),
          dependency_key: Some(key.clone()),
          kind: FailureKind::ParameterNotInScope,
          message: format!(
            "{} needs {key}, but no candidate for it has an in-set covered by the parameters in scope ({}).",
            entry_label(entry),
            params_str(available_params),
          ),
        });
      }
      return Ok(None);
    }

    let candidates = if provided.is_empty() {
      scope_satisfiable
    } else {
      let consuming: Vec<_> = scope_satisfiable
        .into_iter()
        .filter(|e| provided.iter().all(|p| e.params().contains(p)))
        .collect();
      if consuming.is_empty() {
        return Err(Diagnostic {
          rule_id: entry.rule().map(|r| r.id()),
          params: available_params.clone(),
          dependency_key: Some(key.clone()),
          kind: FailureKind::ProvidedParameterUnused,
          message: format!(
            "{} provides parameter(s) {} via {key}, but nothing in its dependency's subgraph consumes them.",
            entry_label(entry),
            params_str(&provided),
          ),
        });
      }
      consuming
    };

    let chosen = choose_dependency(candidates);
    match chosen.len() {
      0 => return Ok(None),
      1 => combination.add_edge(key.clone(), chosen[0].clone()),
      _ => return Err(ambiguous_diagnostic(entry, key, available_params, chosen)),
    }
  }
  Ok(Some(combination))
}

///
/// Prefer the non-ambiguous candidate(s) with the smallest in-set, since that both minimizes the
/// number of distinct node identities in the graph and biases toward receiving values from
/// dependencies rather than dependents.
///
fn choose_dependency<R: Rule>(satisfiable_entries: Vec<&BEntry<R>>) -> Vec<&BEntry<R>> {
  if satisfiable_entries.len() <= 1 {
    return satisfiable_entries;
  }

  let mut minimum = usize::MAX;
  let mut rules = Vec::new();
  for entry in satisfiable_entries {
    let size = entry.params().len();
    if size < minimum {
      rules.clear();
      rules.push(entry);
      minimum = size;
    } else if size == minimum {
      rules.push(entry);
    }
  }
  rules
}

fn powerset<T: Clone>(slice: &[T]) -> impl Iterator<Item = Vec<T>> + '_ {
  (0..(1u64 << slice.len())).map(move |mask| {
    let mut ss = Vec::new();
    let mut bitset = mask;
    while bitset > 0 {
      let rightmost: u64 = bitset & !(bitset - 1);
      let idx = rightmost.trailing_zeros();
      ss.push(slice[idx as usize].clone());
      bitset &= bitset - 1;
    }
    ss
  })
}

///
/// Builds a directed graph over the interned entry handles and checks it for cycles using
/// `petgraph`. A cycle here indicates a bug in the invariants enforced by earlier phases.
///
fn detect_cycle<R: Rule>(
  rule_dependency_edges: &FnvHashMap<Intern<EntryWithDeps<R>>, RuleEdges<R>>,
) -> Option<Diagnostic<R>> {
  let mut graph: DiGraph<(), ()> = DiGraph::new();
  let mut indices: FnvHashMap<Intern<EntryWithDeps<R>>, NodeIndex> = FnvHashMap::default();
  for node in rule_dependency_edges.keys() {
    let idx = graph.add_node(());
    indices.insert(*node, idx);
  }
  for (node, edges) in rule_dependency_edges {
    let from = indices[node];
    for dep in edges.all_dependencies() {
      if let Entry::WithDeps(dep_node) = dep.as_ref() {
        if let Some(&to) = indices.get(dep_node) {
          graph.add_edge(from, to, ());
        }
      }
    }
  }

  if is_cyclic_directed(&graph) {
    Some(Diagnostic {
      rule_id: None,
      params: ParamTypes::default(),
      dependency_key: None,
      kind: FailureKind::Cycle,
      message:
        "Internal error: the finalized rule graph contains a cycle, which should be unreachable."
          .to_string(),
    })
  } else {
    None
  }
}
