use crate::ast::Atom;
use crate::error::Error;
use crate::parse;
use nom::error::convert_error;
use nom::multi::many0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    /// Anything other than `true`/`false` reads as unknown (unconstrained).
    pub fn from_name(name: &str) -> Self {
        match name {
            "true" => Self::True,
            "false" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// One partial observation: a truth value for each constrained atom.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Example {
    pub assignment: Vec<(Atom, Truth)>,
}

impl Example {
    pub fn new(assignment: Vec<(Atom, Truth)>) -> Self {
        Self { assignment }
    }
}

/// Read examples from a text stream.
///
/// Blocks are separated by lines whose trimmed content starts with `---`;
/// each block is a series of `evidence(atom, value).` declarations. A
/// separator always ends a block (so two separators in a row produce an
/// empty example); a trailing unterminated block yields one more example if
/// it contains anything.
pub fn read_examples(source: &str) -> Result<Vec<Example>, Error> {
    let mut examples = vec![];
    let mut block = String::new();
    for line in source.lines() {
        if line.trim_start().starts_with("---") {
            examples.push(parse_block(&std::mem::take(&mut block))?);
        } else {
            block.push_str(line);
            block.push('\n');
        }
    }
    if !block.trim().is_empty() {
        examples.push(parse_block(&block)?);
    }
    Ok(examples)
}

fn parse_block(source: &str) -> Result<Example, Error> {
    match parse::ended(many0(parse::evidence_fact))(source) {
        Ok((_, assignment)) => Ok(Example::new(assignment)),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            Err(Error::Parse(convert_error(source, e)))
        }
        Err(nom::Err::Incomplete(_)) => Err(Error::Parse("incomplete input".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_split_on_separator_lines() {
        let source = "\
            evidence(a, true).\n\
            evidence(b, false).\n\
            ----------\n\
            evidence(a, false).\n";
        let examples = read_examples(source).expect("read failed");
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].assignment.len(), 2);
        assert_eq!(examples[1].assignment.len(), 1);
        assert_eq!(
            examples[0].assignment[1],
            (Atom::constant("b"), Truth::False)
        );
    }

    #[test]
    fn consecutive_separators_produce_an_empty_example() {
        let source = "evidence(a, true).\n---\n---\nevidence(a, false).\n";
        let examples = read_examples(source).expect("read failed");
        assert_eq!(examples.len(), 3);
        assert!(examples[1].assignment.is_empty());
    }

    #[test]
    fn trailing_separator_adds_nothing() {
        let source = "evidence(a, true).\n---\n";
        let examples = read_examples(source).expect("read failed");
        assert_eq!(examples.len(), 1);
    }

    #[test]
    fn unparseable_blocks_are_errors() {
        assert!(read_examples("evidence(a true).\n").is_err());
        assert!(read_examples("frobnicate(a, true).\n").is_err());
    }
}
