use crate::ast::{Annotation, Atom, Clause, Constant, Head, Program, Term, Variable};
use crate::error::Error;
use crate::evidence::Truth;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char as nomchar, multispace1, satisfy},
    combinator::{eof, map as nommap, opt, recognize, value},
    error::{convert_error, ParseError, VerboseError},
    multi::{many0, separated_list1},
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated},
};

pub type IResult<I, O, E = VerboseError<I>> = Result<(I, O), nom::Err<E>>;

type In<'a> = &'a str;

/// Whitespace and `%` line comments.
pub fn ws<'a, E: ParseError<In<'a>>>(s: In<'a>) -> IResult<In<'a>, (), E> {
    let comment = recognize(pair(nomchar('%'), take_while(|c| c != '\n')));
    value((), many0(alt((value((), multispace1), value((), comment)))))(s)
}

pub fn wsl<'a, F, O, E>(inner: F) -> impl FnMut(In<'a>) -> IResult<In<'a>, O, E>
where
    E: ParseError<In<'a>>,
    F: FnMut(In<'a>) -> IResult<In<'a>, O, E> + 'a,
{
    preceded(ws, inner)
}

pub fn ident_suffix(s: In) -> IResult<In, In> {
    take_while(|c: char| c.is_alphanumeric() || c == '_')(s)
}

pub fn constant(s: In) -> IResult<In, Constant> {
    let p = recognize(pair(satisfy(|c| c.is_lowercase() || c.is_ascii_digit()), ident_suffix));
    nommap(wsl(p), |s: In| Constant(s.into()))(s)
}

pub fn variable(s: In) -> IResult<In, Variable> {
    let named = recognize(pair(satisfy(char::is_uppercase), ident_suffix));
    let anon = recognize(nomchar('_'));
    nommap(wsl(alt((named, anon))), |s: In| Variable(s.into()))(s)
}

pub fn number(s: In) -> IResult<In, f64> {
    wsl(double)(s)
}

pub fn term(s: In) -> IResult<In, Term> {
    alt((nommap(variable, Term::Variable), nommap(atom, |a| a.to_term())))(s)
}

pub fn atom(s: In) -> IResult<In, Atom> {
    let args = opt(delimited(
        wsl(nomchar('(')),
        separated_list1(wsl(nomchar(',')), term),
        wsl(nomchar(')')),
    ));
    nommap(pair(constant, args), |(functor, args)| Atom {
        functor,
        args: args.unwrap_or_default(),
    })(s)
}

/// `t(0.5)`, `t(_)` or `t(X)` — a to-be-learned probability, with or without
/// a starting value.
pub fn learnable(s: In) -> IResult<In, Annotation> {
    let start = alt((
        nommap(number, Some),
        nommap(wsl(nomchar('_')), |_| None),
        nommap(variable, |_| None),
    ));
    let p = preceded(
        wsl(nomchar('t')),
        delimited(wsl(nomchar('(')), start, wsl(nomchar(')'))),
    );
    nommap(p, Annotation::Learnable)(s)
}

pub fn annotation(s: In) -> IResult<In, Annotation> {
    alt((learnable, nommap(number, Annotation::Value)))(s)
}

pub fn head(s: In) -> IResult<In, Head> {
    let ann = opt(terminated(annotation, wsl(tag("::"))));
    nommap(pair(ann, atom), |(annotation, atom)| Head { annotation, atom })(s)
}

pub fn clause(s: In) -> IResult<In, Clause> {
    let heads = separated_list1(wsl(nomchar(';')), head);
    let body = opt(preceded(
        wsl(tag(":-")),
        separated_list1(wsl(nomchar(',')), atom),
    ));
    let p = terminated(pair(heads, body), wsl(nomchar('.')));
    nommap(p, |(mut heads, body)| {
        let body = body.unwrap_or_default();
        match (heads.len(), body.is_empty()) {
            (1, true) => Clause::Fact(heads.pop().expect("one head")),
            (1, false) => Clause::Rule { head: heads.pop().expect("one head"), body },
            _ => Clause::Disjunction { heads, body },
        }
    })(s)
}

pub fn program(s: In) -> IResult<In, Program> {
    nommap(many0(clause), |clauses| Program { clauses })(s)
}

/// `evidence(atom, value).` — the shape example blocks are made of.
pub fn evidence_fact(s: In) -> IResult<In, (Atom, Truth)> {
    let open = pair(wsl(tag("evidence")), wsl(nomchar('(')));
    let close = pair(wsl(nomchar(')')), wsl(nomchar('.')));
    let inner = pair(atom, preceded(wsl(nomchar(',')), constant));
    nommap(delimited(open, inner, close), |(atom, v)| {
        (atom, Truth::from_name(&v.0))
    })(s)
}

pub fn ended<'a, F, O>(mut inner: F) -> impl FnMut(In<'a>) -> IResult<In<'a>, O>
where
    F: FnMut(In<'a>) -> IResult<In<'a>, O>,
{
    move |s| {
        let (s, o) = inner(s)?;
        let (s, _) = ws(s)?;
        let (s, _) = eof(s)?;
        Ok((s, o))
    }
}

/// Parse a whole model, converting nom's error into a readable one.
pub fn model(source: &str) -> Result<Program, Error> {
    match ended(program)(source) {
        Ok((_, mut program)) => {
            freshen_wildcards(&mut program);
            Ok(program)
        }
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            Err(Error::Parse(convert_error(source, e)))
        }
        Err(nom::Err::Incomplete(_)) => Err(Error::Parse("incomplete input".into())),
    }
}

/// Each `_` in a clause stands for its own variable; give every occurrence a
/// distinct name so grounding never unifies two of them.
fn freshen_wildcards(program: &mut Program) {
    let mut counter = 0u32;
    let mut rename = |var: &mut Variable| {
        if var.0 == "_" {
            var.0 = format!("_{}", counter);
            counter += 1;
        }
    };
    for clause in &mut program.clauses {
        match clause {
            Clause::Fact(head) => head.atom.visit_variables_mut(&mut rename),
            Clause::Rule { head, body } => {
                head.atom.visit_variables_mut(&mut rename);
                for atom in body {
                    atom.visit_variables_mut(&mut rename);
                }
            }
            Clause::Disjunction { heads, body } => {
                for head in heads.iter_mut() {
                    head.atom.visit_variables_mut(&mut rename);
                }
                for atom in body {
                    atom.visit_variables_mut(&mut rename);
                }
            }
        }
    }
}
