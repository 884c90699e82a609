#[derive(Hash, PartialOrd, Ord, Eq, PartialEq, Clone, Debug)]
pub struct Constant(pub String);

#[derive(Hash, PartialOrd, Ord, Eq, PartialEq, Clone, Debug)]
pub struct Variable(pub String);

#[derive(Hash, PartialOrd, Ord, Eq, PartialEq, Clone, Debug)]
pub enum Term {
    Variable(Variable),
    App(Constant, Vec<Term>),
}

/// A predicate applied to argument terms, e.g. `alarm` or `calls(mary)`.
#[derive(Hash, PartialOrd, Ord, Eq, PartialEq, Clone, Debug)]
pub struct Atom {
    pub functor: Constant,
    pub args: Vec<Term>,
}

/// The probability annotation a head atom may carry.
///
/// `Lookup` never comes out of the parser; the model rewriter introduces it
/// when a `Learnable` annotation is replaced by a weight-slot indirection.
#[derive(PartialOrd, PartialEq, Clone, Debug)]
pub enum Annotation {
    Value(f64),
    Learnable(Option<f64>),
    Lookup(usize),
}

/// Head atom together with its optional annotation.
#[derive(PartialEq, Clone, Debug)]
pub struct Head {
    pub annotation: Option<Annotation>,
    pub atom: Atom,
}

#[derive(PartialEq, Clone, Debug)]
pub enum Clause {
    Fact(Head),
    Rule { head: Head, body: Vec<Atom> },
    Disjunction { heads: Vec<Head>, body: Vec<Atom> },
}

#[derive(PartialEq, Clone, Debug, Default)]
pub struct Program {
    pub clauses: Vec<Clause>,
}

impl Term {
    pub fn constant(s: &str) -> Self {
        Self::App(Constant(s.into()), vec![])
    }
    pub fn visit_variables<'a>(&'a self, visitor: &mut impl FnMut(&'a Variable)) {
        match self {
            Self::Variable(v) => visitor(v),
            Self::App(_, args) => {
                for arg in args {
                    arg.visit_variables(visitor)
                }
            }
        }
    }
    pub fn visit_variables_mut(&mut self, visitor: &mut impl FnMut(&mut Variable)) {
        match self {
            Self::Variable(v) => visitor(v),
            Self::App(_, args) => {
                for arg in args {
                    arg.visit_variables_mut(visitor)
                }
            }
        }
    }
    pub fn is_ground(&self) -> bool {
        match self {
            Self::Variable(_) => false,
            Self::App(_, args) => args.iter().all(Self::is_ground),
        }
    }
}

impl Atom {
    pub fn new(functor: &str, args: Vec<Term>) -> Self {
        Self { functor: Constant(functor.into()), args }
    }
    pub fn constant(functor: &str) -> Self {
        Self::new(functor, vec![])
    }
    pub fn visit_variables<'a>(&'a self, visitor: &mut impl FnMut(&'a Variable)) {
        for arg in &self.args {
            arg.visit_variables(visitor)
        }
    }
    pub fn visit_variables_mut(&mut self, visitor: &mut impl FnMut(&mut Variable)) {
        for arg in &mut self.args {
            arg.visit_variables_mut(visitor)
        }
    }
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(Term::is_ground)
    }
    /// View this atom as a term, e.g. to nest it inside `query(...)`.
    pub fn to_term(&self) -> Term {
        Term::App(self.functor.clone(), self.args.clone())
    }
    /// Inverse of `to_term`. Variables are not atoms.
    pub fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Variable(_) => None,
            Term::App(functor, args) => {
                Some(Self { functor: functor.clone(), args: args.clone() })
            }
        }
    }
}

impl Head {
    pub fn plain(atom: Atom) -> Self {
        Self { annotation: None, atom }
    }
}

impl Clause {
    pub fn heads(&self) -> &[Head] {
        match self {
            Self::Fact(head) | Self::Rule { head, .. } => std::slice::from_ref(head),
            Self::Disjunction { heads, .. } => heads,
        }
    }
    pub fn body(&self) -> &[Atom] {
        match self {
            Self::Fact(_) => &[],
            Self::Rule { body, .. } | Self::Disjunction { body, .. } => body,
        }
    }
    /// `query(q)` declarations are ordinary facts with this shape.
    pub fn as_query(&self) -> Option<Atom> {
        match self {
            Self::Fact(Head { annotation: None, atom }) if atom.functor.0 == "query" => {
                match atom.args.as_slice() {
                    [arg] => Atom::from_term(arg),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
