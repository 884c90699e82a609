//! Grounding: from a symbolic program plus evidence to a propositional
//! structure over dense node ids, ready for compilation.

use crate::ast::{Annotation, Atom, Clause, Constant, Program, Term, Variable};
use crate::error::Error;
use crate::evidence::Truth;
use crate::semiring::WeightRef;
use crate::util::VecSet;
use std::collections::{HashMap, HashSet};

/// Saturation stops rather than chase unbounded term growth past this.
pub const MAX_GROUND_ATOMS: usize = 1 << 16;

/// Dense id of a ground atom within one ground structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// A normalized clause whose heads carry probabilities: a probabilistic fact
/// or rule has one alternative, an annotated disjunction several. Per ground
/// instance, at most one alternative fires.
#[derive(Debug, Clone)]
pub(crate) struct ChoiceClause {
    pub(crate) alternatives: Vec<(WeightRef, Atom)>,
    pub(crate) body: Vec<Atom>,
}

#[derive(Debug, Clone)]
pub(crate) struct RuleClause {
    pub(crate) head: Atom,
    pub(crate) body: Vec<Atom>,
}

/// Output of [`prepare`]: the program in groundable form.
#[derive(Debug, Clone, Default)]
pub struct BaseProgram {
    pub(crate) choices: Vec<ChoiceClause>,
    pub(crate) rules: Vec<RuleClause>,
    pub(crate) queries: Vec<Atom>,
    head_predicates: HashSet<(Constant, usize)>,
    universe: VecSet<Term>,
}

#[derive(Debug, Clone)]
pub(crate) struct GroundChoice {
    pub(crate) alternatives: Vec<(WeightRef, NodeId)>,
    pub(crate) body: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub(crate) struct GroundRule {
    pub(crate) head: NodeId,
    pub(crate) body: Vec<NodeId>,
}

/// The propositional structure for one evidence-atom set.
#[derive(Debug, Clone)]
pub struct GroundProgram {
    pub(crate) atoms: VecSet<Atom>,
    pub(crate) choices: Vec<GroundChoice>,
    pub(crate) rules: Vec<GroundRule>,
    pub(crate) queries: Vec<(Atom, NodeId)>,
    pub(crate) evidence: Vec<(NodeId, Truth)>,
}

impl GroundProgram {
    pub(crate) fn atom(&self, node: NodeId) -> &Atom {
        &self.atoms.as_slice()[node.0 as usize]
    }
}

/// Normalize a program for grounding. Fails on model errors: probability
/// constants outside [0,1], disjunction heads without an annotation, constant
/// disjunction probabilities summing past one, and any `Learnable` annotation
/// that was not rewritten away before reaching the engine.
pub fn prepare(program: &Program) -> Result<BaseProgram, Error> {
    let mut base = BaseProgram::default();
    for clause in &program.clauses {
        if let Some(query) = clause.as_query() {
            base.queries.push(query);
            continue;
        }
        let body = clause.body().to_vec();
        match clause {
            Clause::Fact(head) | Clause::Rule { head, .. } => match &head.annotation {
                None => base.rules.push(RuleClause { head: head.atom.clone(), body }),
                Some(annotation) => {
                    let weight = resolve_annotation(annotation, &head.atom)?;
                    base.choices.push(ChoiceClause {
                        alternatives: vec![(weight, head.atom.clone())],
                        body,
                    });
                }
            },
            Clause::Disjunction { heads, .. } => {
                let mut alternatives = Vec::with_capacity(heads.len());
                let mut constant_sum = 0.0;
                for head in heads {
                    let annotation = head.annotation.as_ref().ok_or_else(|| {
                        Error::Model(format!(
                            "disjunction head `{}` has no probability",
                            head.atom
                        ))
                    })?;
                    let weight = resolve_annotation(annotation, &head.atom)?;
                    if let WeightRef::Value(v) = weight {
                        constant_sum += v;
                    }
                    alternatives.push((weight, head.atom.clone()));
                }
                if constant_sum > 1.0 + 1e-9 {
                    return Err(Error::Model(format!(
                        "disjunction probabilities sum to {constant_sum}"
                    )));
                }
                base.choices.push(ChoiceClause { alternatives, body });
            }
        }
    }
    for choice in &base.choices {
        for (_, atom) in &choice.alternatives {
            base.head_predicates.insert((atom.functor.clone(), atom.args.len()));
            collect_ground_terms(atom, &mut base.universe);
        }
        for atom in &choice.body {
            collect_ground_terms(atom, &mut base.universe);
        }
    }
    for rule in &base.rules {
        base.head_predicates.insert((rule.head.functor.clone(), rule.head.args.len()));
        collect_ground_terms(&rule.head, &mut base.universe);
        for atom in &rule.body {
            collect_ground_terms(atom, &mut base.universe);
        }
    }
    Ok(base)
}

fn resolve_annotation(annotation: &Annotation, atom: &Atom) -> Result<WeightRef, Error> {
    match annotation {
        Annotation::Value(v) if (0.0..=1.0).contains(v) => Ok(WeightRef::Value(*v)),
        Annotation::Value(v) => {
            Err(Error::Model(format!("probability {v} of `{atom}` is outside [0,1]")))
        }
        Annotation::Lookup(slot) => Ok(WeightRef::Slot(*slot)),
        Annotation::Learnable(_) => Err(Error::Model(format!(
            "`{atom}` still carries a to-be-learned probability; it was never rewritten"
        ))),
    }
}

/// Every maximal ground subterm appearing in argument position.
fn collect_ground_terms(atom: &Atom, out: &mut VecSet<Term>) {
    fn walk(term: &Term, out: &mut VecSet<Term>) {
        if term.is_ground() {
            out.insert(term.clone());
        } else if let Term::App(_, args) = term {
            for arg in args {
                walk(arg, out);
            }
        }
    }
    for arg in &atom.args {
        walk(arg, out);
    }
}

impl Term {
    fn consistently_assign<'a>(
        &'a self,
        concrete: &'a Term,
        map: &mut HashMap<&'a Variable, &'a Term>,
    ) -> bool {
        match [self, concrete] {
            [Self::Variable(v), x] => {
                if let Some(y) = map.get(v) {
                    &x == y
                } else {
                    map.insert(v, x);
                    true
                }
            }
            [Self::App(f, xs), Self::App(g, ys)] if f == g && xs.len() == ys.len() => xs
                .iter()
                .zip(ys.iter())
                .all(|(x, y)| x.consistently_assign(y, map)),
            _ => false,
        }
    }

    fn concretize(&self, map: &HashMap<&Variable, Term>) -> Term {
        match self {
            Self::Variable(v) => map.get(v).expect("unassigned!").clone(),
            Self::App(f, args) => {
                Self::App(f.clone(), args.iter().map(|arg| arg.concretize(map)).collect())
            }
        }
    }
}

impl Atom {
    fn matches<'a>(
        &'a self,
        concrete: &'a Atom,
        map: &mut HashMap<&'a Variable, &'a Term>,
    ) -> bool {
        self.functor == concrete.functor
            && self.args.len() == concrete.args.len()
            && self
                .args
                .iter()
                .zip(concrete.args.iter())
                .all(|(pattern, arg)| pattern.consistently_assign(arg, map))
    }

    fn concretize(&self, map: &HashMap<&Variable, Term>) -> Atom {
        Atom {
            functor: self.functor.clone(),
            args: self.args.iter().map(|arg| arg.concretize(map)).collect(),
        }
    }
}

/// Enumerate substitutions that make every body atom one of the possible
/// atoms, binding variables incrementally.
fn each_body_match<'a, F: FnMut(&HashMap<&'a Variable, &'a Term>)>(
    body: &'a [Atom],
    possible: &'a VecSet<Atom>,
    map: &mut HashMap<&'a Variable, &'a Term>,
    out: &mut F,
) {
    match body {
        [] => out(map),
        [first, rest @ ..] => {
            for concrete in possible.iter() {
                let mut local = map.clone();
                if first.matches(concrete, &mut local) {
                    each_body_match(rest, possible, &mut local, out);
                }
            }
        }
    }
}

/// Head variables the body left unbound, each listed once.
fn unbound_of<'a>(
    vars: &[&'a Variable],
    bound: &HashMap<&'a Variable, Term>,
) -> Vec<&'a Variable> {
    let mut unbound: Vec<&Variable> = vec![];
    for v in vars.iter().copied() {
        if !bound.contains_key(v) && !unbound.contains(&v) {
            unbound.push(v);
        }
    }
    unbound
}

/// Enumerate universe values for variables the body left unbound.
fn each_completion<'a, F: FnMut(&HashMap<&'a Variable, Term>)>(
    unbound: &[&'a Variable],
    universe: &VecSet<Term>,
    map: &mut HashMap<&'a Variable, Term>,
    out: &mut F,
) {
    match unbound {
        [] => out(map),
        [first, rest @ ..] => {
            for value in universe.iter() {
                map.insert(first, value.clone());
                each_completion(rest, universe, map, out);
            }
            map.remove(first);
        }
    }
}

/// Ground `base` under `evidence`, reusing `prev` when it was built for the
/// same evidence atoms (only the truth values are replaced then).
pub fn ground(
    base: &BaseProgram,
    prev: Option<&GroundProgram>,
    evidence: &[(Atom, Truth)],
) -> Result<GroundProgram, Error> {
    for (atom, _) in evidence {
        if !atom.is_ground() {
            return Err(Error::Ground(format!("evidence atom `{atom}` is not ground")));
        }
        if !base.head_predicates.contains(&(atom.functor.clone(), atom.args.len())) {
            return Err(Error::Ground(format!(
                "evidence atom `{atom}` has no matching clause head"
            )));
        }
    }

    if let Some(prev) = prev {
        let same_atoms = prev.evidence.len() == evidence.len()
            && prev
                .evidence
                .iter()
                .zip(evidence.iter())
                .all(|((node, _), (atom, _))| prev.atom(*node) == atom);
        if same_atoms {
            let mut reused = prev.clone();
            for (slot, (_, truth)) in reused.evidence.iter_mut().zip(evidence.iter()) {
                slot.1 = *truth;
            }
            return Ok(reused);
        }
    }

    let mut universe = base.universe.clone();
    for (atom, _) in evidence {
        collect_ground_terms(atom, &mut universe);
    }

    let mut possible: VecSet<Atom> = VecSet::default();
    // Dedup keys strip the weights (f64 is not hashable); parallel vecs hold
    // the instances themselves.
    let mut choice_keys: VecSet<(usize, Vec<Atom>, Vec<Atom>)> = VecSet::default();
    let mut choice_insts: Vec<(Vec<(WeightRef, Atom)>, Vec<Atom>)> = vec![];
    let mut rule_insts: VecSet<(Atom, Vec<Atom>)> = VecSet::default();

    loop {
        let mut pending_choices = vec![];
        let mut pending_rules = vec![];
        for (cidx, choice) in base.choices.iter().enumerate() {
            let mut vars = vec![];
            for (_, atom) in &choice.alternatives {
                atom.visit_variables(&mut |v| vars.push(v));
            }
            each_body_match(&choice.body, &possible, &mut HashMap::new(), &mut |bound| {
                let mut owned: HashMap<&Variable, Term> =
                    bound.iter().map(|(&v, &t)| (v, t.clone())).collect();
                let unbound = unbound_of(&vars, &owned);
                each_completion(&unbound, &universe, &mut owned, &mut |sub| {
                    let alternatives: Vec<(WeightRef, Atom)> = choice
                        .alternatives
                        .iter()
                        .map(|(w, atom)| (*w, atom.concretize(sub)))
                        .collect();
                    let body: Vec<Atom> =
                        choice.body.iter().map(|atom| atom.concretize(sub)).collect();
                    pending_choices.push((cidx, alternatives, body));
                });
            });
        }
        for rule in &base.rules {
            let mut vars = vec![];
            rule.head.visit_variables(&mut |v| vars.push(v));
            each_body_match(&rule.body, &possible, &mut HashMap::new(), &mut |bound| {
                let mut owned: HashMap<&Variable, Term> =
                    bound.iter().map(|(&v, &t)| (v, t.clone())).collect();
                let unbound = unbound_of(&vars, &owned);
                each_completion(&unbound, &universe, &mut owned, &mut |sub| {
                    let head = rule.head.concretize(sub);
                    let body: Vec<Atom> =
                        rule.body.iter().map(|atom| atom.concretize(sub)).collect();
                    pending_rules.push((head, body));
                });
            });
        }

        let mut grew = false;
        for (cidx, alternatives, body) in pending_choices {
            let atoms: Vec<Atom> = alternatives.iter().map(|(_, a)| a.clone()).collect();
            let key = (cidx, atoms, body.clone());
            if !choice_keys.contains(&key) {
                choice_keys.insert(key);
                for (_, atom) in &alternatives {
                    possible.insert(atom.clone());
                }
                choice_insts.push((alternatives, body));
                grew = true;
            }
        }
        for (head, body) in pending_rules {
            if !rule_insts.contains(&(head.clone(), body.clone())) {
                possible.insert(head.clone());
                rule_insts.insert((head, body));
                grew = true;
            }
        }
        if possible.len() > MAX_GROUND_ATOMS {
            return Err(Error::Ground(format!(
                "ground atom budget exhausted ({} atoms)",
                possible.len()
            )));
        }
        if !grew {
            break;
        }
    }
    tracing::debug!(
        atoms = possible.len(),
        choices = choice_insts.len(),
        rules = rule_insts.len(),
        "grounding saturated"
    );

    // Intern into dense node ids. Evidence atoms become nodes even when
    // nothing can derive them.
    let mut atoms: VecSet<Atom> = VecSet::default();
    let node = |atoms: &mut VecSet<Atom>, atom: &Atom| NodeId(atoms.insert(atom.clone()) as u32);

    let mut choices = vec![];
    for (alternatives, body) in &choice_insts {
        choices.push(GroundChoice {
            alternatives: alternatives
                .iter()
                .map(|(w, atom)| (*w, node(&mut atoms, atom)))
                .collect(),
            body: body.iter().map(|atom| node(&mut atoms, atom)).collect(),
        });
    }
    let mut rules = vec![];
    for (head, body) in rule_insts.iter() {
        rules.push(GroundRule {
            head: node(&mut atoms, head),
            body: body.iter().map(|atom| node(&mut atoms, atom)).collect(),
        });
    }

    let mut queries = vec![];
    let mut query_seen = HashSet::new();
    for pattern in &base.queries {
        for concrete in possible.iter() {
            if pattern.matches(concrete, &mut HashMap::new()) && query_seen.insert(concrete.clone())
            {
                queries.push((concrete.clone(), node(&mut atoms, concrete)));
            }
        }
    }

    let evidence = evidence
        .iter()
        .map(|(atom, truth)| (node(&mut atoms, atom), *truth))
        .collect();

    Ok(GroundProgram { atoms, choices, rules, queries, evidence })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn base(source: &str) -> BaseProgram {
        prepare(&parse::model(source).expect("parse failed")).expect("prepare failed")
    }

    #[test]
    fn prepare_classifies_clauses() {
        let base = base(
            "0.1::burglary. 0.2::earthquake.\n\
             alarm :- burglary. alarm :- earthquake.\n\
             0.3::hot; 0.6::cold :- weather.\n\
             query(alarm).",
        );
        assert_eq!(base.choices.len(), 3);
        assert_eq!(base.rules.len(), 2);
        assert_eq!(base.queries, vec![Atom::constant("alarm")]);
        assert_eq!(base.choices[2].alternatives.len(), 2);
    }

    #[test]
    fn prepare_rejects_bad_models() {
        let bad = [
            "1.5::p.",
            "p; q.",
            "0.8::p; 0.7::q.",
            "t(_)::p.", // unrewritten learnable
        ];
        for source in bad {
            let program = parse::model(source).expect("parse failed");
            assert!(matches!(prepare(&program), Err(Error::Model(_))), "{source}");
        }
    }

    #[test]
    fn grounds_the_alarm_model() {
        let base = base(
            "0.1::burglary. 0.2::earthquake.\n\
             alarm :- burglary. alarm :- earthquake.",
        );
        let g = ground(&base, None, &[(Atom::constant("alarm"), Truth::True)])
            .expect("ground failed");
        assert_eq!(g.choices.len(), 2);
        assert_eq!(g.rules.len(), 2);
        // burglary, earthquake, alarm
        assert_eq!(g.atoms.len(), 3);
        assert_eq!(g.evidence.len(), 1);
        assert_eq!(g.atom(g.evidence[0].0), &Atom::constant("alarm"));
    }

    #[test]
    fn instantiates_variables_from_derived_atoms() {
        let base = base(
            "0.5::coin(c1). 0.5::coin(c2).\n\
             some :- coin(C).",
        );
        let g = ground(&base, None, &[]).expect("ground failed");
        assert_eq!(g.choices.len(), 2);
        assert_eq!(g.rules.len(), 2);
    }

    #[test]
    fn unbound_head_variables_range_over_the_universe() {
        let base = base("0.5::p(X).");
        let evidence = [(Atom::new("p", vec![Term::constant("a")]), Truth::True)];
        let g = ground(&base, None, &evidence).expect("ground failed");
        assert_eq!(g.choices.len(), 1);
        assert_eq!(g.atom(g.choices[0].alternatives[0].1), &evidence[0].0);
    }

    #[test]
    fn query_patterns_resolve_to_ground_instances() {
        let base = base("0.5::p(a). 0.5::p(b). query(p(X)).");
        let g = ground(&base, None, &[]).expect("ground failed");
        assert_eq!(g.queries.len(), 2);
    }

    #[test]
    fn evidence_must_be_ground_and_known() {
        let base = base("0.5::p(a).");
        let unknown = [(Atom::constant("q"), Truth::True)];
        assert!(matches!(ground(&base, None, &unknown), Err(Error::Ground(_))));
        let open = [(
            Atom::new("p", vec![Term::Variable(Variable("X".into()))]),
            Truth::True,
        )];
        assert!(matches!(ground(&base, None, &open), Err(Error::Ground(_))));
    }

    #[test]
    fn previous_structure_is_reused_for_same_atoms() {
        let base = base("0.5::p. q :- p.");
        let first = ground(&base, None, &[(Atom::constant("q"), Truth::True)])
            .expect("ground failed");
        let second = ground(&base, Some(&first), &[(Atom::constant("q"), Truth::False)])
            .expect("ground failed");
        assert_eq!(second.atoms, first.atoms);
        assert_eq!(second.evidence[0].1, Truth::False);
        // different atom set falls back to a fresh grounding
        let third = ground(&base, Some(&first), &[(Atom::constant("p"), Truth::True)])
            .expect("ground failed");
        assert_eq!(third.atom(third.evidence[0].0), &Atom::constant("p"));
    }
}
