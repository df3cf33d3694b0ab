//! Expression parser
//!
//! A recursive descent parser for pricing expressions: decimal literals,
//! identifiers, `+ - * / %`, unary minus and parentheses. `*`, `/` and `%`
//! bind tighter than `+` and `-`; all binary operators are left-associative.

use crate::ast::{BinaryOperator, Expr, UnaryOperator};
use crate::error::{FormulaError, FormulaResult};
use std::fmt;

/// Deepest parenthesis/unary nesting accepted before giving up
const MAX_NESTING: usize = 256;

/// Most binary operators in one expression
///
/// Operator chains build a left-deep tree, so this bounds the height of the
/// AST that evaluation and drop recurse over.
const MAX_OPERATORS: usize = 512;

/// Parse an expression string into an AST
///
/// # Example
/// ```rust
/// use ratecard_formula::parse_expression;
///
/// let ast = parse_expression("base_credits * complexityMultiplier").unwrap();
/// let ast = parse_expression("(a + b) * -2.5e1").unwrap();
/// assert!(parse_expression("a +").is_err());
/// ```
pub fn parse_expression(expression: &str) -> FormulaResult<Expr> {
    let mut parser = FormulaParser::new(expression)?;
    let expr = parser.parse_expression()?;

    // Make sure we consumed all input
    if *parser.current_token() != Token::Eof {
        return Err(FormulaError::syntax(
            format!("unexpected {} after expression", parser.current_token()),
            parser.token_start,
        ));
    }

    Ok(expr)
}

/// List the identifiers an expression references, in first-use order
///
/// Uses the same tokenizer as [`parse_expression`], so the result never
/// includes anything the evaluator would not look up. The expression only
/// has to tokenize, not parse.
pub fn extract_identifiers(expression: &str) -> FormulaResult<Vec<String>> {
    let mut scanner = FormulaParser::new(expression)?;
    let mut names: Vec<String> = Vec::new();
    loop {
        match scanner.consume()? {
            Token::Eof => break,
            Token::Identifier(name) => {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            _ => {}
        }
    }
    Ok(names)
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Delimiters
    LeftParen,
    RightParen,

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Identifier(name) => write!(f, "identifier '{}'", name),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Percent => f.write_str("'%'"),
            Token::LeftParen => f.write_str("'('"),
            Token::RightParen => f.write_str("')'"),
            Token::Eof => f.write_str("end of expression"),
        }
    }
}

/// Expression parser
struct FormulaParser<'a> {
    input: &'a str,
    pos: usize,
    current_token: Token,
    /// Byte offset where `current_token` starts
    token_start: usize,
    depth: usize,
    operators: usize,
}

impl<'a> FormulaParser<'a> {
    fn new(input: &'a str) -> FormulaResult<Self> {
        let mut parser = Self {
            input,
            pos: 0,
            current_token: Token::Eof,
            token_start: 0,
            depth: 0,
            operators: 0,
        };
        parser.advance_token()?;
        Ok(parser)
    }

    // === Token scanning ===

    fn advance_token(&mut self) -> FormulaResult<()> {
        self.skip_whitespace();
        self.token_start = self.pos;
        self.current_token = self.scan_token()?;
        Ok(())
    }

    fn scan_token(&mut self) -> FormulaResult<Token> {
        let c = match self.peek_char() {
            Some(c) => c,
            None => return Ok(Token::Eof),
        };

        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '(' => Some(Token::LeftParen),
            ')' => Some(Token::RightParen),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        if c.is_ascii_digit() || (c == '.' && self.peek_char_at(1).map_or(false, |c| c.is_ascii_digit()))
        {
            return self.scan_number();
        }

        if c.is_ascii_alphabetic() || c == '_' {
            return Ok(self.scan_identifier());
        }

        Err(FormulaError::syntax(
            format!("unexpected character '{}'", c),
            self.pos,
        ))
    }

    fn scan_number(&mut self) -> FormulaResult<Token> {
        let start = self.pos;

        // Integer part
        self.skip_digits();

        // Decimal part
        if self.peek_char() == Some('.') {
            self.advance();
            self.skip_digits();
        }

        // Exponent part, only when digits actually follow
        if self.peek_char().map_or(false, |c| c == 'e' || c == 'E') {
            let sign = self.peek_char_at(1).map_or(false, |c| c == '+' || c == '-');
            let digit_at = if sign { 2 } else { 1 };
            if self
                .peek_char_at(digit_at)
                .map_or(false, |c| c.is_ascii_digit())
            {
                for _ in 0..digit_at {
                    self.advance();
                }
                self.skip_digits();
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| FormulaError::syntax(format!("invalid number '{}'", num_str), start))
    }

    fn scan_identifier(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek_char()
            .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance();
        }
        Token::Identifier(self.input[start..self.pos].to_string())
    }

    // === Helper methods ===

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(offset)
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_digits(&mut self) {
        while self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().map_or(false, |c| c.is_whitespace()) {
            self.advance();
        }
    }

    fn current_token(&self) -> &Token {
        &self.current_token
    }

    fn consume(&mut self) -> FormulaResult<Token> {
        let token = std::mem::replace(&mut self.current_token, Token::Eof);
        self.advance_token()?;
        Ok(token)
    }

    fn unexpected(&self) -> FormulaError {
        FormulaError::syntax(
            format!("unexpected {}", self.current_token()),
            self.token_start,
        )
    }

    fn enter(&mut self) -> FormulaResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(FormulaError::syntax(
                format!("expression nested deeper than {} levels", MAX_NESTING),
                self.token_start,
            ));
        }
        Ok(())
    }

    fn count_operator(&mut self) -> FormulaResult<()> {
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(FormulaError::syntax(
                format!("expression has more than {} operators", MAX_OPERATORS),
                self.token_start,
            ));
        }
        Ok(())
    }

    // === Expression parsing with precedence ===
    // Precedence (lowest to highest):
    // 1. Addition/Subtraction: +, -
    // 2. Multiplication/Division/Remainder: *, /, %
    // 3. Unary: -, +
    // 4. Primary: literals, identifiers, parentheses

    fn parse_expression(&mut self) -> FormulaResult<Expr> {
        self.parse_additive()
    }

    fn parse_additive(&mut self) -> FormulaResult<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.current_token() {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Subtract,
                _ => break,
            };

            self.count_operator()?;
            self.consume()?;
            let right = self.parse_multiplicative()?;
            left = Expr::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> FormulaResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.current_token() {
                Token::Star => BinaryOperator::Multiply,
                Token::Slash => BinaryOperator::Divide,
                Token::Percent => BinaryOperator::Remainder,
                _ => break,
            };

            self.count_operator()?;
            self.consume()?;
            let right = self.parse_unary()?;
            left = Expr::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> FormulaResult<Expr> {
        match self.current_token() {
            Token::Minus => {
                self.enter()?;
                self.consume()?;
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::UnaryOp {
                    op: UnaryOperator::Negate,
                    operand: Box::new(operand),
                })
            }
            Token::Plus => {
                // Unary plus is a no-op
                self.enter()?;
                self.consume()?;
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(operand)
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> FormulaResult<Expr> {
        match self.current_token().clone() {
            Token::Number(n) => {
                self.consume()?;
                Ok(Expr::Number(n))
            }
            Token::Identifier(name) => {
                let position = self.token_start;
                self.consume()?;
                Ok(Expr::Identifier { name, position })
            }
            Token::LeftParen => {
                let open = self.token_start;
                self.enter()?;
                self.consume()?;
                let expr = self.parse_expression()?;
                if *self.current_token() != Token::RightParen {
                    return Err(FormulaError::syntax(
                        format!(
                            "expected ')' to close '(' at position {}, found {}",
                            open,
                            self.current_token()
                        ),
                        self.token_start,
                    ));
                }
                self.consume()?;
                self.depth -= 1;
                Ok(expr)
            }
            _ => Err(self.unexpected()),
        }
    }
}
