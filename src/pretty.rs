use crate::ast::{Annotation, Atom, Clause, Constant, Head, Program, Term, Variable};
use crate::evidence::Truth;
use std::fmt::{Display, Formatter, Result as FmtResult};

impl Display for Constant {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Self::Variable(v) => v.fmt(f),
            Self::App(functor, args) => {
                functor.fmt(f)?;
                write_args(f, args)
            }
        }
    }
}

impl Display for Atom {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        self.functor.fmt(f)?;
        write_args(f, &self.args)
    }
}

fn write_args(f: &mut Formatter, args: &[Term]) -> FmtResult {
    if args.is_empty() {
        return Ok(());
    }
    write!(f, "(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        arg.fmt(f)?;
    }
    write!(f, ")")
}

impl Display for Annotation {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Learnable(None) => write!(f, "t(_)"),
            Self::Learnable(Some(v)) => write!(f, "t({})", v),
            Self::Lookup(slot) => write!(f, "w({})", slot),
        }
    }
}

impl Display for Head {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        if let Some(annotation) = &self.annotation {
            write!(f, "{}::", annotation)?;
        }
        self.atom.fmt(f)
    }
}

impl Display for Clause {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        for (i, head) in self.heads().iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            head.fmt(f)?;
        }
        let body = self.body();
        if !body.is_empty() {
            write!(f, " :- ")?;
            for (i, atom) in body.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                atom.fmt(f)?;
            }
        }
        write!(f, ".")
    }
}

impl Display for Program {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        for clause in &self.clauses {
            writeln!(f, "{}", clause)?;
        }
        Ok(())
    }
}

impl Display for Truth {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    #[test]
    fn clauses_print_in_source_syntax() {
        let source = "0.3::alarm :- burglary, quake(X).\nt(_)::coin(c1); t(0.5)::coin(c2).\n";
        let program = parse::model(source).expect("parse failed");
        assert_eq!(program.to_string(), source);
    }
}
