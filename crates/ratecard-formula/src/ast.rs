//! Expression Abstract Syntax Tree types

use std::fmt;

/// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Number(f64),

    /// Identifier, resolved against the evaluation context
    Identifier {
        name: String,
        /// Byte offset of the identifier in the source text
        position: usize,
    },

    /// Binary operation
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Unary operation
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
}

impl Expr {
    /// Collect identifier names in first-use order, without duplicates
    pub fn identifiers(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_identifiers(&mut names);
        names
    }

    fn collect_identifiers<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Identifier { name, .. } => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                left.collect_identifiers(names);
                right.collect_identifiers(names);
            }
            Expr::UnaryOp { operand, .. } => operand.collect_identifiers(names),
        }
    }

    /// Binding strength used when printing; atoms bind tightest
    fn precedence(&self) -> u8 {
        match self {
            Expr::Number(_) | Expr::Identifier { .. } => 4,
            Expr::UnaryOp { .. } => 3,
            Expr::BinaryOp { op, .. } => op.precedence(),
        }
    }
}

/// Prints the expression with the minimal parentheses needed to reparse it
/// to the same tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Identifier { name, .. } => f.write_str(name),
            Expr::UnaryOp { op, operand } => {
                f.write_str(op.symbol())?;
                if operand.precedence() < self.precedence() {
                    write!(f, "({})", operand)
                } else {
                    write!(f, "{}", operand)
                }
            }
            Expr::BinaryOp { op, left, right } => {
                let prec = op.precedence();
                if left.precedence() < prec {
                    write!(f, "({})", left)?;
                } else {
                    write!(f, "{}", left)?;
                }
                write!(f, " {} ", op.symbol())?;
                // Left-associative: an equal-precedence right operand needs parentheses
                if right.precedence() <= prec {
                    write!(f, "({})", right)
                } else {
                    write!(f, "{}", right)
                }
            }
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
}

impl BinaryOperator {
    /// Source symbol
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Remainder => "%",
        }
    }

    /// `*`, `/` and `%` bind tighter than `+` and `-`
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOperator::Add | BinaryOperator::Subtract => 1,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Remainder => 2,
        }
    }

    /// Apply the operator with IEEE-754 semantics
    pub fn apply(self, l: f64, r: f64) -> f64 {
        match self {
            BinaryOperator::Add => l + r,
            BinaryOperator::Subtract => l - r,
            BinaryOperator::Multiply => l * r,
            BinaryOperator::Divide => l / r,
            BinaryOperator::Remainder => l % r,
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Negate,
}

impl UnaryOperator {
    /// Source symbol
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOperator::Negate => "-",
        }
    }
}
