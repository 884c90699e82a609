//! Compilation and evaluation: exhaustive weighted model counting over the
//! choice groups of a ground structure.
//!
//! The learning loop only touches the surface here (`compile`, `evaluator`,
//! `evaluate_evidence`, `queries`, `evaluate`), so the representation behind
//! it can change without touching the loop.

use crate::ast::Atom;
use crate::error::Error;
use crate::evidence::Truth;
use crate::ground::{GroundProgram, NodeId};
use crate::semiring::{ParameterSource, WeightRef};
use std::collections::HashMap;

/// Enumeration stops being a reasonable backend past this many outcomes.
pub const MAX_WORLDS: u64 = 1 << 22;

#[derive(Debug, Clone)]
struct CompiledChoice {
    alternatives: Vec<(WeightRef, NodeId)>,
    body: Vec<NodeId>,
}

/// An evaluable form of one ground structure. Built once per example,
/// re-evaluated every round under fresh parameter values.
#[derive(Debug, Clone)]
pub struct Circuit {
    atoms: Vec<Atom>,
    index: HashMap<Atom, NodeId>,
    choices: Vec<CompiledChoice>,
    rules: Vec<(NodeId, Vec<NodeId>)>,
    queries: Vec<(Atom, NodeId)>,
    worlds: u64,
}

pub fn compile(ground: &GroundProgram) -> Result<Circuit, Error> {
    let mut worlds: u128 = 1;
    for choice in &ground.choices {
        worlds = worlds.saturating_mul(choice.alternatives.len() as u128 + 1);
    }
    if worlds > MAX_WORLDS as u128 {
        return Err(Error::Compile(worlds.min(u64::MAX as u128) as u64));
    }
    let worlds = worlds as u64;

    let atoms: Vec<Atom> = ground.atoms.as_slice().to_vec();
    let index = atoms
        .iter()
        .enumerate()
        .map(|(i, atom)| (atom.clone(), NodeId(i as u32)))
        .collect();
    Ok(Circuit {
        atoms,
        index,
        choices: ground
            .choices
            .iter()
            .map(|c| CompiledChoice {
                alternatives: c.alternatives.clone(),
                body: c.body.clone(),
            })
            .collect(),
        rules: ground.rules.iter().map(|r| (r.head, r.body.clone())).collect(),
        queries: ground.queries.clone(),
        worlds,
    })
}

impl Circuit {
    pub fn node_of(&self, atom: &Atom) -> Option<NodeId> {
        self.index.get(atom).copied()
    }

    /// Size of the outcome space one evaluation sweeps.
    pub fn worlds(&self) -> u64 {
        self.worlds
    }

    /// Build an evaluator against the given parameter source and evidence
    /// values. The whole outcome space is swept here, once; the accessor
    /// methods just read the accumulated sums.
    ///
    /// Evidence must be over atoms this structure was grounded with.
    pub fn evaluator<P: ParameterSource>(
        &self,
        params: &P,
        evidence: &[(Atom, Truth)],
    ) -> Evaluator {
        let constraints: Vec<(NodeId, Truth)> = evidence
            .iter()
            .map(|(atom, truth)| {
                let node = self.node_of(atom).expect("evidence atom not in circuit");
                (node, *truth)
            })
            .collect();
        let (evidence_probability, marginals) = self.sweep(params, &constraints);
        Evaluator { circuit: self, evidence_probability, marginals }
    }

    fn sweep<P: ParameterSource>(
        &self,
        params: &P,
        constraints: &[(NodeId, Truth)],
    ) -> (f64, Vec<f64>) {
        let n = self.atoms.len();
        let mut p_evidence = 0.0;
        let mut marginals = vec![0.0; n];
        let mut truth = vec![false; n];

        // One resolve per weight per sweep; the source is read-only within a
        // round.
        let resolved: Vec<Vec<f64>> = self
            .choices
            .iter()
            .map(|c| c.alternatives.iter().map(|(w, _)| params.resolve(*w)).collect())
            .collect();

        let mut outcome = vec![0usize; self.choices.len()];
        loop {
            let mut weight = 1.0;
            for (c, choice) in self.choices.iter().enumerate() {
                let k = outcome[c];
                weight *= if k < choice.alternatives.len() {
                    resolved[c][k]
                } else {
                    1.0 - resolved[c].iter().sum::<f64>()
                };
            }
            if weight != 0.0 {
                self.fixpoint(&outcome, &mut truth);
                let consistent = constraints.iter().all(|(node, t)| match t {
                    Truth::True => truth[node.0 as usize],
                    Truth::False => !truth[node.0 as usize],
                    Truth::Unknown => true,
                });
                if consistent {
                    p_evidence += weight;
                    for (i, &t) in truth.iter().enumerate() {
                        if t {
                            marginals[i] += weight;
                        }
                    }
                }
            }
            // odometer over choice outcomes
            let mut i = 0;
            loop {
                if i == outcome.len() {
                    return (p_evidence, marginals);
                }
                outcome[i] += 1;
                if outcome[i] <= self.choices[i].alternatives.len() {
                    break;
                }
                outcome[i] = 0;
                i += 1;
            }
        }
    }

    /// Which atoms hold in the world picked by `outcome`.
    fn fixpoint(&self, outcome: &[usize], truth: &mut [bool]) {
        truth.fill(false);
        loop {
            let mut changed = false;
            for (c, choice) in self.choices.iter().enumerate() {
                let k = outcome[c];
                if k < choice.alternatives.len() {
                    let (_, head) = choice.alternatives[k];
                    let head = head.0 as usize;
                    if !truth[head] && choice.body.iter().all(|b| truth[b.0 as usize]) {
                        truth[head] = true;
                        changed = true;
                    }
                }
            }
            for (head, body) in &self.rules {
                let head = head.0 as usize;
                if !truth[head] && body.iter().all(|b| truth[b.0 as usize]) {
                    truth[head] = true;
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }
}

/// Probabilities of one circuit under one parameter source and one evidence
/// assignment.
pub struct Evaluator<'a> {
    circuit: &'a Circuit,
    evidence_probability: f64,
    marginals: Vec<f64>,
}

impl Evaluator<'_> {
    /// P(evidence) under the parameter source the evaluator was built with.
    pub fn evaluate_evidence(&self) -> f64 {
        self.evidence_probability
    }

    /// The registered query atoms and their node handles.
    pub fn queries(&self) -> &[(Atom, NodeId)] {
        &self.circuit.queries
    }

    /// Posterior probability of `node` given the evidence. Zero when the
    /// evidence itself has probability zero.
    pub fn evaluate(&self, node: NodeId) -> f64 {
        if self.evidence_probability > 0.0 {
            self.marginals[node.0 as usize] / self.evidence_probability
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Annotation, Clause, Head, Program};
    use crate::ground;
    use crate::parse;
    use crate::semiring::ConstSource;

    fn circuit(source: &str, evidence: &[(Atom, Truth)]) -> Circuit {
        let program = parse::model(source).expect("parse failed");
        let base = ground::prepare(&program).expect("prepare failed");
        compile(&ground::ground(&base, None, evidence).expect("ground failed"))
            .expect("compile failed")
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn a_single_fact_has_its_declared_probability() {
        let c = circuit("0.3::p. query(p).", &[]);
        let e = c.evaluator(&ConstSource, &[]);
        assert!(close(e.evaluate_evidence(), 1.0));
        let node = e.queries()[0].1;
        assert!(close(e.evaluate(node), 0.3));
    }

    #[test]
    fn conditioning_on_evidence() {
        let evidence = [(Atom::constant("p"), Truth::True)];
        let c = circuit("0.3::p. query(p).", &evidence);
        let e = c.evaluator(&ConstSource, &evidence);
        assert!(close(e.evaluate_evidence(), 0.3));
        assert!(close(e.evaluate(e.queries()[0].1), 1.0));

        let negative = [(Atom::constant("p"), Truth::False)];
        let e = c.evaluator(&ConstSource, &negative);
        assert!(close(e.evaluate_evidence(), 0.7));
        assert!(close(e.evaluate(e.queries()[0].1), 0.0));

        let unknown = [(Atom::constant("p"), Truth::Unknown)];
        let e = c.evaluator(&ConstSource, &unknown);
        assert!(close(e.evaluate_evidence(), 1.0));
    }

    #[test]
    fn derived_atoms_combine_as_noisy_or() {
        let evidence = [(Atom::constant("alarm"), Truth::True)];
        let c = circuit(
            "0.1::burglary. 0.2::earthquake.\n\
             alarm :- burglary. alarm :- earthquake.\n\
             query(burglary).",
            &evidence,
        );
        // P(alarm) = 1 - 0.9 * 0.8 = 0.28
        let e = c.evaluator(&ConstSource, &evidence);
        assert!(close(e.evaluate_evidence(), 0.28));
        assert!(close(e.evaluate(e.queries()[0].1), 0.1 / 0.28));
    }

    #[test]
    fn disjunction_heads_are_exclusive() {
        let evidence = [(Atom::constant("hot"), Truth::True)];
        let c = circuit("0.3::hot; 0.6::cold. query(cold).", &evidence);
        let e = c.evaluator(&ConstSource, &evidence);
        assert!(close(e.evaluate_evidence(), 0.3));
        assert!(close(e.evaluate(e.queries()[0].1), 0.0));
    }

    #[test]
    fn slot_references_resolve_through_the_parameter_source() {
        struct Fixed(Vec<f64>);
        impl ParameterSource for Fixed {
            fn resolve(&self, weight: WeightRef) -> f64 {
                match weight {
                    WeightRef::Value(v) => v,
                    WeightRef::Slot(i) => self.0[i],
                }
            }
        }
        let program = Program {
            clauses: vec![Clause::Fact(Head {
                annotation: Some(Annotation::Lookup(0)),
                atom: Atom::constant("p"),
            })],
        };
        let base = ground::prepare(&program).expect("prepare failed");
        let g = ground::ground(&base, None, &[]).expect("ground failed");
        let c = compile(&g).expect("compile failed");
        let node = c.node_of(&Atom::constant("p")).expect("node");
        for value in [0.2, 0.9] {
            let e = c.evaluator(&Fixed(vec![value]), &[]);
            assert!(close(e.evaluate(node), value));
        }
    }

    #[test]
    fn oversized_outcome_spaces_refuse_to_compile() {
        let source: String = (0..23).map(|i| format!("0.5::p{i}. ")).collect();
        let program = parse::model(&source).expect("parse failed");
        let base = ground::prepare(&program).expect("prepare failed");
        let g = ground::ground(&base, None, &[]).expect("ground failed");
        assert!(matches!(compile(&g), Err(Error::Compile(_))));
    }
}
