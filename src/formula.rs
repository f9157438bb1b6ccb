//! Recursive infix formula serialization.
//!
//! Grounded in `hpcprof::sinks::MetaDB::accumulateFormulaString`
//! (`original_source/src/hpcprof/sinks/metadb.cpp`): a two-stack discipline
//! (a "is this the first operand we've seen at this depth" flag per level,
//! and an "infix separator to emit before the next operand" string per
//! level) that walks an expression tree and emits its textual infix form.

use crate::error::{Error, ErrorKind};

/// An arithmetic operator a [`Expression::Op`] node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// N-ary addition.
    Sum,
    /// Binary subtraction.
    Sub,
    /// Unary negation.
    Neg,
    /// N-ary multiplication.
    Prod,
    /// Binary division.
    Div,
    /// Binary exponentiation.
    Pow,
    /// Unary square root.
    Sqrt,
    /// Binary logarithm (base as second operand).
    Log,
    /// Unary natural logarithm.
    Ln,
    /// N-ary minimum.
    Min,
    /// N-ary maximum.
    Max,
    /// Unary floor.
    Floor,
    /// Unary ceiling.
    Ceil,
}

impl OpKind {
    /// The text written before the first operand.
    ///
    /// Binary arithmetic operators (`sum`/`sub`/`prod`/`div`/`pow`) use a
    /// bare `(` and rely on their infix symbol to be unambiguous; the
    /// function-like operators spell out their name.
    fn prefix(self) -> &'static str {
        match self {
            OpKind::Sum | OpKind::Sub | OpKind::Prod | OpKind::Div | OpKind::Pow => "(",
            OpKind::Neg => "-(",
            OpKind::Sqrt => "sqrt(",
            OpKind::Log => "log(",
            OpKind::Ln => "ln(",
            OpKind::Min => "min(",
            OpKind::Max => "max(",
            OpKind::Floor => "floor(",
            OpKind::Ceil => "ceil(",
        }
    }

    /// The text written between two consecutive operands.
    fn infix(self) -> &'static str {
        match self {
            OpKind::Sum => "+",
            OpKind::Sub => "-",
            OpKind::Prod => "*",
            OpKind::Div => "/",
            OpKind::Pow => "^",
            OpKind::Log => ",",
            OpKind::Min => ",",
            OpKind::Max => ",",
            // Unary operators never see a second operand.
            OpKind::Neg | OpKind::Sqrt | OpKind::Ln | OpKind::Floor | OpKind::Ceil => "",
        }
    }

    /// The text written after the last operand.
    fn suffix(self) -> &'static str {
        ")"
    }
}

/// A leaf kind that is only legal in a model's *source* representation,
/// never in a formula delivered to this writer. Formulas must already be
/// flattened to `Constant`/`UserValue`/`Op` by the time they reach us;
/// encountering one of these is a fatal programmer error, not a recoverable
/// input error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// An unevaluated constant placeholder (distinct from [`Expression::Constant`]).
    ConstantPlaceholder,
    /// A reference to another, not-yet-inlined subexpression.
    Subexpression,
    /// A named variable reference.
    Variable,
}

/// An arithmetic expression tree, as delivered to the writer by the model.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A literal double-precision constant.
    Constant(f64),
    /// The metric's own accumulated value at this point (written as `$`).
    UserValue,
    /// An operator applied to one or more operands.
    Op(OpKind, Vec<Expression>),
    /// An illegal leaf that should never reach this writer.
    Leaf(LeafKind),
}

/// Serializes `expr` into its textual infix form.
///
/// Returns [`ErrorKind::Invariant`] if `expr` contains a [`Expression::Leaf`]
/// anywhere in the tree — such formulas are not flattened and must not be
/// handed to this writer.
pub fn serialize(expr: &Expression) -> Result<String, Error> {
    let mut out = String::new();
    write_expr(expr, &mut out)?;
    Ok(out)
}

fn write_expr(expr: &Expression, out: &mut String) -> Result<(), Error> {
    match expr {
        Expression::Constant(value) => {
            out.push_str(&format_constant(*value));
            Ok(())
        }
        Expression::UserValue => {
            out.push_str("$$");
            Ok(())
        }
        Expression::Op(op, operands) => {
            out.push_str(op.prefix());
            let mut first = true;
            for operand in operands {
                if !first {
                    out.push_str(op.infix());
                }
                first = false;
                write_expr(operand, out)?;
            }
            out.push_str(op.suffix());
            Ok(())
        }
        Expression::Leaf(kind) => Err(ErrorKind::Invariant.into_formula_error(*kind)),
    }
}

fn format_constant(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

impl ErrorKind {
    fn into_formula_error(self, kind: LeafKind) -> Error {
        Error::new(
            self,
            std::io::Error::other(format!("unflattened formula leaf: {kind:?}")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_operators_match_the_reference_shape() {
        // max(sum($$, 3), -ln(2))
        let expr = Expression::Op(
            OpKind::Max,
            vec![
                Expression::Op(
                    OpKind::Sum,
                    vec![Expression::UserValue, Expression::Constant(3.0)],
                ),
                Expression::Op(
                    OpKind::Neg,
                    vec![Expression::Op(OpKind::Ln, vec![Expression::Constant(2.0)])],
                ),
            ],
        );
        assert_eq!(serialize(&expr).unwrap(), "max(($$+3),-(ln(2)))");
    }

    #[test]
    fn unflattened_leaf_is_an_invariant_error() {
        let err = serialize(&Expression::Leaf(LeafKind::Variable)).unwrap_err();
        matches!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn integral_constants_render_without_a_decimal_point() {
        assert_eq!(
            serialize(&Expression::Constant(3.0)).unwrap(),
            "3"
        );
    }
}
