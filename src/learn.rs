//! Parameter learning from partial observations.
//!
//! A model's to-be-learned probabilities (`t(_)::atom`) are estimated by
//! fixed-point iteration: rewrite the model so every learnable probability
//! reads from a weight store, compile one circuit per example, then
//! alternate evaluating posteriors under the current weights with replacing
//! the weights by the posterior means, until the evidence log-likelihood
//! stops improving.

use crate::ast::{Annotation, Atom, Clause, Constant, Head, Program};
use crate::circuit::{self, Circuit};
use crate::error::Error;
use crate::evidence::{Example, Truth};
use crate::ground::{self, BaseProgram};
use crate::semiring::{ParameterSource, WeightRef};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Posteriors below this report as exactly zero.
const POSTERIOR_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub max_iterations: usize,
    pub min_improvement: f64,
    /// Seed for the initial draw of weights declared without a starting
    /// value. Fixing it fixes the whole weight trajectory.
    pub seed: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self { max_iterations: 10_000, min_improvement: 1e-10, seed: 0 }
    }
}

/// Current estimates plus the metadata tying each slot to its origin: the
/// original annotated atom (for display) and the synthetic query atom whose
/// functor maps back to the slot.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    values: Vec<f64>,
    names: Vec<Head>,
    queries: Vec<Atom>,
    slot_by_functor: HashMap<Constant, usize>,
}

impl WeightStore {
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn values(&self) -> &[f64] {
        &self.values
    }
    pub fn names(&self) -> &[Head] {
        &self.names
    }
    /// The synthetic query atom exposing each slot to the engine.
    pub fn queries(&self) -> &[Atom] {
        &self.queries
    }
    fn push(&mut self, value: f64, name: Head, query: Atom) -> usize {
        let slot = self.values.len();
        self.slot_by_functor.insert(query.functor.clone(), slot);
        self.values.push(value);
        self.names.push(name);
        self.queries.push(query);
        slot
    }
    fn slot_of(&self, functor: &Constant) -> Option<usize> {
        self.slot_by_functor.get(functor).copied()
    }
    /// The store is only ever replaced by a complete vector, never written
    /// slot by slot.
    fn replace_values(&mut self, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.values.len());
        self.values = values;
    }
}

impl ParameterSource for WeightStore {
    fn resolve(&self, weight: WeightRef) -> f64 {
        match weight {
            WeightRef::Value(v) => v,
            WeightRef::Slot(slot) => self.values[slot],
        }
    }
}

/// Rewrite every learnable probability into a weight-slot indirection.
///
/// `t(s)::p(X) :- b(X).` becomes
///
/// ```text
/// w(i)::learned_i(X) :- b(X).
/// p(X) :- learned_i(X).
/// query(learned_i(X)).
/// ```
///
/// with slot `i` initialized to `s`, or drawn from `rng` when no starting
/// value was declared. Pre-existing `query/1` declarations are dropped; the
/// rewriter owns query declaration from here on. Annotated disjunctions are
/// rewritten head by head, keeping the shared body. Slots are allocated in
/// first-occurrence order, eagerly, so the rewritten program and the store
/// are fixed before any grounding happens.
pub fn rewrite(source: &Program, rng: &mut StdRng) -> Result<(Program, WeightStore), Error> {
    let mut store = WeightStore::default();
    let mut clauses = vec![];
    for clause in &source.clauses {
        if clause.as_query().is_some() {
            continue;
        }
        match clause {
            Clause::Fact(head) => {
                let (head, extra) = process_head(head, &mut store, rng)?;
                clauses.push(Clause::Fact(head));
                clauses.extend(extra);
            }
            Clause::Rule { head, body } => {
                let (head, extra) = process_head(head, &mut store, rng)?;
                clauses.push(Clause::Rule { head, body: body.clone() });
                clauses.extend(extra);
            }
            Clause::Disjunction { heads, body } => {
                let mut new_heads = vec![];
                let mut extras = vec![];
                for head in heads {
                    let (head, extra) = process_head(head, &mut store, rng)?;
                    new_heads.push(head);
                    extras.extend(extra);
                }
                clauses.push(Clause::Disjunction { heads: new_heads, body: body.clone() });
                clauses.extend(extras);
            }
        }
    }
    Ok((Program { clauses }, store))
}

fn process_head(
    head: &Head,
    store: &mut WeightStore,
    rng: &mut StdRng,
) -> Result<(Head, Vec<Clause>), Error> {
    let start = match &head.annotation {
        Some(Annotation::Learnable(start)) => start,
        _ => return Ok((head.clone(), vec![])),
    };
    if let Some(v) = start {
        if !(0.0..=1.0).contains(v) {
            return Err(Error::Model(format!(
                "starting value {v} of `{head}` is outside [0,1]"
            )));
        }
    }
    let value = start.unwrap_or_else(|| rng.gen());
    let fact = Atom::new(&format!("learned_{}", store.len()), head.atom.args.clone());
    let slot = store.push(value, head.clone(), fact.clone());
    let replacement = Head { annotation: Some(Annotation::Lookup(slot)), atom: fact.clone() };
    let extra = vec![
        Clause::Rule { head: Head::plain(head.atom.clone()), body: vec![fact.clone()] },
        Clause::Fact(Head::plain(Atom::new("query", vec![fact.to_term()]))),
    ];
    Ok((replacement, extra))
}

/// The (atom set, assignment, circuit) triple for one example instance.
struct CompiledExample {
    evidence: Vec<(Atom, Truth)>,
    circuit: Circuit,
}

pub struct Learner {
    store: WeightStore,
    compiled: Vec<CompiledExample>,
    options: Options,
    iteration: usize,
}

/// What a finished run reports.
#[derive(Debug, Clone)]
pub struct Learned {
    /// Final log-likelihood of the evidence, summed over examples.
    pub score: f64,
    pub weights: Vec<f64>,
    /// The original annotated atoms, parallel to `weights`.
    pub names: Vec<Head>,
    pub iterations: usize,
}

impl Learner {
    /// Rewrite the model, group the examples by constrained atom set, and
    /// compile one circuit per example instance. Runs once, before the first
    /// round.
    pub fn prepare(
        program: &Program,
        examples: &[Example],
        options: Options,
    ) -> Result<Self, Error> {
        let mut rng = StdRng::seed_from_u64(options.seed);
        let (rewritten, store) = rewrite(program, &mut rng)?;
        let base = ground::prepare(&rewritten)?;
        let compiled = compile_examples(&base, examples)?;
        Ok(Self { store, compiled, options, iteration: 0 })
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    /// One round: posteriors under the current weights, then the update.
    pub fn step(&mut self) -> Result<f64, Error> {
        self.iteration += 1;
        let results = self.evaluate();
        self.update(results)
    }

    /// Iterate to convergence or until the iteration budget runs out
    /// (running out is not an error; the estimate so far is reported).
    pub fn run(mut self) -> Result<Learned, Error> {
        let mut delta = f64::INFINITY;
        let mut previous = -1e10;
        while self.iteration < self.options.max_iterations
            && delta > self.options.min_improvement
        {
            let score = self.step()?;
            debug!(iteration = self.iteration, score, "round finished");
            delta = score - previous;
            previous = score;
        }
        Ok(Learned {
            score: previous,
            weights: self.store.values,
            names: self.store.names,
            iterations: self.iteration,
        })
    }

    /// Evidence probability and clamped query posteriors, per example. The
    /// store is read-only here; examples evaluate independently.
    fn evaluate(&self) -> Vec<(f64, Vec<(usize, f64)>)> {
        self.compiled
            .par_iter()
            .map(|example| {
                let evaluator = example.circuit.evaluator(&self.store, &example.evidence);
                let posteriors = evaluator
                    .queries()
                    .iter()
                    .map(|(atom, node)| {
                        let w = evaluator.evaluate(*node);
                        let w = if w < POSTERIOR_FLOOR { 0.0 } else { w };
                        let slot = self
                            .store
                            .slot_of(&atom.functor)
                            .expect("query atom without a slot");
                        (slot, w)
                    })
                    .collect();
                (evaluator.evaluate_evidence(), posteriors)
            })
            .collect()
    }

    /// Replace each contributed-to slot by the mean of its posteriors and
    /// score the round. Slots nothing contributed to keep their estimate.
    fn update(&mut self, results: Vec<(f64, Vec<(usize, f64)>)>) -> Result<f64, Error> {
        let count = self.store.len();
        let mut marginal = vec![0.0; count];
        let mut contributions = vec![0usize; count];
        let mut score = 0.0;
        for (i, (p_evidence, posteriors)) in results.iter().enumerate() {
            if *p_evidence <= 0.0 {
                return Err(Error::ZeroEvidence { example: i });
            }
            for (slot, value) in posteriors {
                marginal[*slot] += value;
                contributions[*slot] += 1;
            }
            score += p_evidence.ln();
        }
        let values = (0..count)
            .map(|slot| {
                if contributions[slot] > 0 {
                    marginal[slot] / contributions[slot] as f64
                } else {
                    self.store.values[slot]
                }
            })
            .collect();
        self.store.replace_values(values);
        Ok(score)
    }
}

/// Group examples by their sorted atom set (a partition: every example lands
/// in exactly one group, duplicates stay separate instances), then ground and
/// compile each instance, reusing the previous ground structure within a
/// group. Instances that fail to ground or compile are skipped with a
/// warning; everything else aborts preparation.
fn compile_examples(
    base: &BaseProgram,
    examples: &[Example],
) -> Result<Vec<CompiledExample>, Error> {
    let mut groups: BTreeMap<Vec<Atom>, Vec<Vec<Truth>>> = BTreeMap::new();
    for example in examples {
        let mut assignment = example.assignment.clone();
        assignment.sort_by(|a, b| a.0.cmp(&b.0));
        let (atoms, values): (Vec<_>, Vec<_>) = assignment.into_iter().unzip();
        groups.entry(atoms).or_default().push(values);
    }

    let mut compiled = vec![];
    for (atoms, instances) in &groups {
        let mut prev = None;
        for values in instances {
            let evidence: Vec<(Atom, Truth)> =
                atoms.iter().cloned().zip(values.iter().copied()).collect();
            let ground = match ground::ground(base, prev.as_ref(), &evidence) {
                Ok(ground) => ground,
                Err(e) if e.example_scoped() => {
                    warn!(error = %e, "skipping example");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match circuit::compile(&ground) {
                Ok(circuit) => {
                    debug!(worlds = circuit.worlds(), "compiled example");
                    compiled.push(CompiledExample { evidence, circuit });
                }
                Err(e) if e.example_scoped() => warn!(error = %e, "skipping example"),
                Err(e) => return Err(e),
            }
            prev = Some(ground);
        }
    }
    Ok(compiled)
}

/// Estimate the model's to-be-learned probabilities from the examples.
/// Returns the final score, the weights with their originating atoms, and
/// the number of rounds run.
pub fn learn(program: &Program, examples: &[Example], options: &Options) -> Result<Learned, Error> {
    Learner::prepare(program, examples, options.clone())?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn model(source: &str) -> Program {
        parse::model(source).expect("parse failed")
    }

    fn rewritten(source: &str) -> (Program, WeightStore) {
        rewrite(&model(source), &mut StdRng::seed_from_u64(0)).expect("rewrite failed")
    }

    fn truth_example(pairs: &[(&str, Truth)]) -> Example {
        Example::new(
            pairs.iter().map(|(name, t)| (Atom::constant(name), *t)).collect(),
        )
    }

    #[test]
    fn one_slot_per_learnable_occurrence() {
        let (program, store) = rewritten(
            "t(_)::p(X) :- b(X).\n\
             t(_)::p(X) :- c(X).\n\
             0.2::b(1). 0.3::c(1).",
        );
        assert_eq!(store.len(), 2);
        // each occurrence: rewritten clause + redirection + query
        assert_eq!(program.clauses.len(), 8);
        assert_eq!(store.slot_of(&Constant("learned_0".into())), Some(0));
        assert_eq!(store.slot_of(&Constant("learned_1".into())), Some(1));
        assert_eq!(store.queries()[1].functor.0, "learned_1");
    }

    #[test]
    fn source_queries_are_dropped() {
        let (program, _) = rewritten("t(_)::p. query(p). query(q).");
        let queries: Vec<Atom> =
            program.clauses.iter().filter_map(Clause::as_query).collect();
        assert_eq!(queries, vec![Atom::constant("learned_0")]);
    }

    #[test]
    fn start_values_are_kept_and_draws_are_seeded() {
        let (_, store) = rewritten("t(0.5)::p. t(_)::q.");
        assert_eq!(store.values()[0], 0.5);
        let again = rewritten("t(0.5)::p. t(_)::q.").1;
        assert_eq!(store.values(), again.values());
    }

    #[test]
    fn bad_start_values_are_model_errors() {
        let result = rewrite(&model("t(1.5)::p."), &mut StdRng::seed_from_u64(0));
        assert!(matches!(result, Err(Error::Model(_))));
    }

    #[test]
    fn disjunctions_rewrite_head_by_head() {
        let (program, store) = rewritten("t(_)::heads; t(_)::tails.");
        assert_eq!(store.len(), 2);
        match &program.clauses[0] {
            Clause::Disjunction { heads, body } => {
                assert!(body.is_empty());
                assert_eq!(heads[0].annotation, Some(Annotation::Lookup(0)));
                assert_eq!(heads[1].annotation, Some(Annotation::Lookup(1)));
            }
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn grouping_is_a_partition() {
        let (program, _) = rewritten("t(0.5)::a. t(0.5)::b.");
        let base = ground::prepare(&program).expect("prepare failed");
        let examples = [
            truth_example(&[("a", Truth::True), ("b", Truth::True)]),
            truth_example(&[("b", Truth::False), ("a", Truth::False)]),
            truth_example(&[("a", Truth::True)]),
            truth_example(&[("a", Truth::True)]),
        ];
        let compiled = compile_examples(&base, &examples).expect("compile failed");
        assert_eq!(compiled.len(), 4);
        // stable group order: sorted atom sets, instances in input order
        let atom_sets: Vec<Vec<&Atom>> = compiled
            .iter()
            .map(|c| c.evidence.iter().map(|(a, _)| a).collect())
            .collect();
        assert_eq!(atom_sets[0], atom_sets[1]);
        assert_eq!(atom_sets[2], atom_sets[3]);
        assert_ne!(atom_sets[0], atom_sets[2]);
    }

    #[test]
    fn ungroundable_examples_are_skipped_not_fatal() {
        let (program, _) = rewritten("t(0.5)::p.");
        let base = ground::prepare(&program).expect("prepare failed");
        let examples = [
            truth_example(&[("no_such_thing", Truth::True)]),
            truth_example(&[("p", Truth::True)]),
        ];
        let compiled = compile_examples(&base, &examples).expect("compile failed");
        assert_eq!(compiled.len(), 1);
    }

    #[test]
    fn tiny_posteriors_clamp_to_zero() {
        let program = model("t(0.0000001)::p.");
        let examples = [truth_example(&[("p", Truth::Unknown)])];
        let learner =
            Learner::prepare(&program, &examples, Options::default()).expect("prepare failed");
        let results = learner.evaluate();
        assert_eq!(results[0].1, vec![(0, 0.0)]);
    }

    #[test]
    fn slots_without_contributions_keep_their_value() {
        // the second learnable is guarded by an underivable body, so no
        // example ever reports a posterior for it
        let program = model("t(0.5)::p. t(0.3)::q(X) :- r(X).");
        let examples = [truth_example(&[("p", Truth::True)])];
        let mut learner =
            Learner::prepare(&program, &examples, Options::default()).expect("prepare failed");
        learner.step().expect("step failed");
        assert_eq!(learner.store().values()[0], 1.0);
        assert_eq!(learner.store().values()[1], 0.3);
    }

    #[test]
    fn impossible_evidence_is_a_fatal_numerical_error() {
        let program = model("0.0::p. t(0.5)::q.");
        let examples = [truth_example(&[("p", Truth::True)])];
        let result = learn(&program, &examples, &Options::default());
        assert!(matches!(result, Err(Error::ZeroEvidence { example: 0 })));
    }
}
