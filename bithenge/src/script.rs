//! Script parsing: turns a textual schema into a transform graph.
//!
//! A script is a sequence of `transform name = …;` definitions. Each
//! definition is wrapped in a barrier with the declared parameter
//! count, registered before its body is parsed (so a definition can
//! call itself), and resolvable from every later definition. Built-in
//! primitives resolve without declaration. The result of parsing is
//! the `main` transform.

mod lexer;

use std::rc::Rc;

use bithenge_tree::{Error, Node, Result};

use crate::compound::{new_composed_transform, IfTransform, PartialTransform};
use crate::expression::{
    BinaryExpression, BinaryOp, ConstExpression, ExprRef, ExpressionTransform, InNodeExpression,
    InputlessTransform, ParamExpression, ParamWrapper, ScopeMemberExpression, SubblobExpression,
};
use crate::sequence::{DoWhileTransform, NamedField, RepeatTransform, StructTransform};
use crate::transform::{primitive_transform, BarrierTransform, InvalidTransform, XformRef};

use lexer::{Lexer, Token, TokenKind};

/// Parse a script, returning its `main` transform. `filename` is used
/// only in diagnostics.
pub fn parse_script(filename: &str, text: &str) -> Result<XformRef> {
    let mut parser = Parser::new(filename, text)?;
    while parser.token.kind != TokenKind::Eof {
        parser.parse_definition()?;
    }
    parser
        .lookup("main")
        .ok_or_else(|| Error::Syntax(format!("{filename}: no `main` transform")))
}

/// Read and parse a script file.
pub fn parse_script_file(path: impl AsRef<std::path::Path>) -> Result<XformRef> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    parse_script(&path.to_string_lossy(), &text)
}

struct Parser<'a> {
    filename: &'a str,
    lexer: Lexer<'a>,
    token: Token,
    named: Vec<(String, Rc<BarrierTransform>)>,
    param_names: Vec<String>,
    /// Whether the expression just parsed mentioned `in`; decides
    /// between an expression transform and an inputless one.
    in_node_used: bool,
}

impl<'a> Parser<'a> {
    fn new(filename: &'a str, text: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(filename, text);
        let token = lexer.next_token()?;
        Ok(Parser {
            filename,
            lexer,
            token,
            named: Vec::new(),
            param_names: Vec::new(),
            in_node_used: false,
        })
    }

    fn bump(&mut self) -> Result<()> {
        self.token = self.lexer.next_token()?;
        Ok(())
    }

    fn error(&self, message: &str) -> Error {
        Error::Syntax(format!(
            "{}:{}:{}: {}, found {}",
            self.filename,
            self.token.line,
            self.token.column,
            message,
            self.token.kind.describe()
        ))
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if &self.token.kind == kind {
            self.bump()
        } else {
            Err(self.error(&format!("expected {}", kind.describe())))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match &self.token.kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.bump()?;
                Ok(name)
            }
            _ => Err(self.error("expected an identifier")),
        }
    }

    /// Resolve a transform name: user definitions shadow primitives,
    /// later definitions shadow earlier ones.
    fn lookup(&self, name: &str) -> Option<XformRef> {
        self.named
            .iter()
            .rev()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, barrier)| Rc::clone(barrier) as XformRef)
            .or_else(|| primitive_transform(name))
    }

    fn parse_definition(&mut self) -> Result<()> {
        self.expect(&TokenKind::Transform)?;
        let name = self.expect_identifier()?;

        debug_assert!(self.param_names.is_empty());
        if self.token.kind == TokenKind::LParen {
            self.bump()?;
            while self.token.kind != TokenKind::RParen {
                if !self.param_names.is_empty() {
                    self.expect(&TokenKind::Comma)?;
                }
                let param = self.expect_identifier()?;
                self.param_names.push(param);
            }
            self.expect(&TokenKind::RParen)?;
        }

        tracing::trace!(transform = %name, params = self.param_names.len(), "parsing definition");
        // Registered before the body so the body can invoke it.
        let barrier = Rc::new(BarrierTransform::new(self.param_names.len()));
        self.named.push((name, Rc::clone(&barrier)));

        self.expect(&TokenKind::Equal)?;
        let body = self.parse_transform()?;
        self.expect(&TokenKind::Semicolon)?;
        barrier.set_subtransform(body);

        self.param_names.clear();
        Ok(())
    }

    fn parse_transform(&mut self) -> Result<XformRef> {
        let mut xforms = vec![self.parse_transform_no_compose()?];
        while self.token.kind == TokenKind::LeftArrow {
            self.bump()?;
            xforms.push(self.parse_transform_no_compose()?);
        }
        Ok(new_composed_transform(xforms))
    }

    fn parse_transform_no_compose(&mut self) -> Result<XformRef> {
        match self.token.kind {
            TokenKind::LParen => {
                self.bump()?;
                self.in_node_used = false;
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen)?;
                if self.in_node_used {
                    Ok(Rc::new(ExpressionTransform::new(expr)))
                } else {
                    Ok(Rc::new(InputlessTransform::new(expr)))
                }
            }
            TokenKind::Do => self.parse_do_while(),
            TokenKind::Identifier(_) => self.parse_invocation(),
            TokenKind::If => self.parse_if_transform(),
            TokenKind::Partial => self.parse_partial(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::Struct => {
                self.bump()?;
                self.expect(&TokenKind::LBrace)?;
                let xform = self.parse_struct_body()?;
                self.expect(&TokenKind::RBrace)?;
                Ok(xform)
            }
            TokenKind::Switch => self.parse_switch(false),
            _ => Err(self.error("expected a transform")),
        }
    }

    fn parse_invocation(&mut self) -> Result<XformRef> {
        let name = self.expect_identifier()?;
        let xform = self
            .lookup(&name)
            .ok_or_else(|| self.error(&format!("unknown transform `{name}`")))?;

        let mut params = Vec::new();
        if self.token.kind == TokenKind::LParen {
            self.bump()?;
            while self.token.kind != TokenKind::RParen {
                if !params.is_empty() {
                    self.expect(&TokenKind::Comma)?;
                }
                params.push(self.parse_expression()?);
            }
            self.expect(&TokenKind::RParen)?;
        }

        if xform.num_params() != params.len() {
            return Err(self.error(&format!(
                "`{name}` takes {} parameter(s), not {}",
                xform.num_params(),
                params.len()
            )));
        }
        if params.is_empty() {
            Ok(xform)
        } else {
            Ok(Rc::new(ParamWrapper::new(xform, params)))
        }
    }

    fn parse_if_transform(&mut self) -> Result<XformRef> {
        self.expect(&TokenKind::If)?;
        self.expect(&TokenKind::LParen)?;
        let condition = self.parse_expression()?;
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::LBrace)?;
        let on_true = self.parse_transform()?;
        self.expect(&TokenKind::RBrace)?;
        self.expect(&TokenKind::Else)?;
        self.expect(&TokenKind::LBrace)?;
        let on_false = self.parse_transform()?;
        self.expect(&TokenKind::RBrace)?;
        Ok(Rc::new(IfTransform::new(condition, on_true, on_false)))
    }

    fn parse_if_struct(&mut self) -> Result<XformRef> {
        self.expect(&TokenKind::If)?;
        self.expect(&TokenKind::LParen)?;
        let condition = self.parse_expression()?;
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::LBrace)?;
        let on_true = self.parse_struct_body()?;
        self.expect(&TokenKind::RBrace)?;
        let on_false = if self.token.kind == TokenKind::Else {
            self.bump()?;
            self.expect(&TokenKind::LBrace)?;
            let body = self.parse_struct_body()?;
            self.expect(&TokenKind::RBrace)?;
            body
        } else {
            // An absent branch contributes no entries.
            empty_transform()
        };
        Ok(Rc::new(IfTransform::new(condition, on_true, on_false)))
    }

    fn parse_switch(&mut self, in_struct: bool) -> Result<XformRef> {
        self.expect(&TokenKind::Switch)?;
        self.expect(&TokenKind::LParen)?;
        let ref_expr = self.parse_expression()?;
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::LBrace)?;

        let mut arms: Vec<(ExprRef, XformRef)> = Vec::new();
        while self.token.kind != TokenKind::RBrace {
            let condition: ExprRef = if self.token.kind == TokenKind::Else {
                self.bump()?;
                Rc::new(ConstExpression::new(Node::Boolean(true)))
            } else {
                let case = self.parse_expression()?;
                Rc::new(BinaryExpression::new(
                    BinaryOp::Equals,
                    Rc::clone(&ref_expr),
                    case,
                ))
            };
            self.expect(&TokenKind::Colon)?;
            let xform = if in_struct {
                self.expect(&TokenKind::LBrace)?;
                let body = self.parse_struct_body()?;
                self.expect(&TokenKind::RBrace)?;
                body
            } else {
                self.parse_transform()?
            };
            self.expect(&TokenKind::Semicolon)?;
            arms.push((condition, xform));
        }
        self.expect(&TokenKind::RBrace)?;

        // switch desugars to a right-nested if chain over `ref == case`,
        // falling through to the always-failing transform.
        let mut result: XformRef = Rc::new(InvalidTransform);
        for (condition, xform) in arms.into_iter().rev() {
            result = Rc::new(IfTransform::new(condition, xform, result));
        }
        Ok(result)
    }

    fn parse_repeat(&mut self) -> Result<XformRef> {
        self.expect(&TokenKind::Repeat)?;
        let mut count = None;
        if self.token.kind == TokenKind::LParen {
            self.bump()?;
            count = Some(self.parse_expression()?);
            self.expect(&TokenKind::RParen)?;
        }
        self.expect(&TokenKind::LBrace)?;
        let xform = self.parse_transform()?;
        self.expect(&TokenKind::RBrace)?;
        Ok(Rc::new(RepeatTransform::new(xform, count)))
    }

    fn parse_do_while(&mut self) -> Result<XformRef> {
        self.expect(&TokenKind::Do)?;
        self.expect(&TokenKind::LBrace)?;
        let xform = self.parse_transform()?;
        self.expect(&TokenKind::RBrace)?;
        self.expect(&TokenKind::While)?;
        self.expect(&TokenKind::LParen)?;
        let condition = self.parse_expression()?;
        self.expect(&TokenKind::RParen)?;
        Ok(Rc::new(DoWhileTransform::new(xform, condition)))
    }

    fn parse_partial(&mut self) -> Result<XformRef> {
        self.expect(&TokenKind::Partial)?;
        let mut offset_xform: Option<XformRef> = None;
        if self.token.kind == TokenKind::LParen {
            self.bump()?;
            let offset = self.parse_expression()?;
            self.expect(&TokenKind::RParen)?;
            // partial(o) first projects the input from offset o to the
            // end, then applies the body to a prefix of that.
            let projected = SubblobExpression::new(Rc::new(InNodeExpression), offset, None, true);
            offset_xform = Some(Rc::new(ExpressionTransform::new(Rc::new(projected))));
        }
        self.expect(&TokenKind::LBrace)?;
        let inner = self.parse_transform()?;
        self.expect(&TokenKind::RBrace)?;

        let partial: XformRef = Rc::new(PartialTransform::new(inner));
        Ok(match offset_xform {
            Some(offset) => new_composed_transform(vec![partial, offset]),
            None => partial,
        })
    }

    fn parse_struct_body(&mut self) -> Result<XformRef> {
        let mut fields: Vec<NamedField> = Vec::new();
        while self.token.kind != TokenKind::RBrace {
            match self.token.kind {
                TokenKind::If => fields.push((None, self.parse_if_struct()?)),
                TokenKind::Switch => fields.push((None, self.parse_switch(true)?)),
                _ => {
                    let name = if self.token.kind == TokenKind::Dot {
                        self.bump()?;
                        Some(Rc::from(self.expect_identifier()?))
                    } else {
                        None
                    };
                    self.expect(&TokenKind::LeftArrow)?;
                    let xform = self.parse_transform()?;
                    self.expect(&TokenKind::Semicolon)?;
                    fields.push((name, xform));
                }
            }
        }
        Ok(Rc::new(StructTransform::new(fields)))
    }

    fn parse_expression(&mut self) -> Result<ExprRef> {
        self.parse_expression_precedence(0)
    }

    fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
        Some(match kind {
            TokenKind::AndAnd => (BinaryOp::And, 1),
            TokenKind::OrOr => (BinaryOp::Or, 1),
            TokenKind::EqualEqual => (BinaryOp::Equals, 2),
            TokenKind::NotEqual => (BinaryOp::NotEquals, 2),
            TokenKind::Less => (BinaryOp::LessThan, 3),
            TokenKind::LessEqual => (BinaryOp::LessThanOrEqual, 3),
            TokenKind::Greater => (BinaryOp::GreaterThan, 3),
            TokenKind::GreaterEqual => (BinaryOp::GreaterThanOrEqual, 3),
            TokenKind::Plus => (BinaryOp::Add, 4),
            TokenKind::Minus => (BinaryOp::Subtract, 4),
            TokenKind::PlusPlus => (BinaryOp::Concat, 4),
            TokenKind::Star => (BinaryOp::Multiply, 5),
            TokenKind::SlashSlash => (BinaryOp::IntegerDivide, 5),
            TokenKind::Percent => (BinaryOp::Modulo, 5),
            _ => return None,
        })
    }

    fn parse_expression_precedence(&mut self, outer: u8) -> Result<ExprRef> {
        let mut expr = self.parse_postfix_expression()?;
        while let Some((op, precedence)) = Self::binary_op(&self.token.kind) {
            if precedence <= outer {
                break;
            }
            self.bump()?;
            let rhs = self.parse_expression_precedence(precedence)?;
            expr = Rc::new(BinaryExpression::new(op, expr, rhs));
        }
        Ok(expr)
    }

    fn parse_postfix_expression(&mut self) -> Result<ExprRef> {
        let mut expr = self.parse_term()?;
        loop {
            match self.token.kind {
                TokenKind::Dot => {
                    self.bump()?;
                    let name = self.expect_identifier()?;
                    let key = Rc::new(ConstExpression::new(Node::string(name)));
                    expr = Rc::new(BinaryExpression::new(BinaryOp::Member, expr, key));
                }
                TokenKind::LBracket => {
                    self.bump()?;
                    let start = self.parse_expression()?;
                    match self.token.kind {
                        TokenKind::Comma | TokenKind::Colon => {
                            let absolute = self.token.kind == TokenKind::Colon;
                            self.bump()?;
                            let limit = if absolute && self.token.kind == TokenKind::RBracket {
                                None
                            } else {
                                Some(self.parse_expression()?)
                            };
                            self.expect(&TokenKind::RBracket)?;
                            expr = Rc::new(SubblobExpression::new(expr, start, limit, absolute));
                        }
                        TokenKind::RBracket => {
                            self.bump()?;
                            expr = Rc::new(BinaryExpression::new(BinaryOp::Member, expr, start));
                        }
                        _ => return Err(self.error("expected `,`, `:`, or `]`")),
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<ExprRef> {
        match self.token.kind.clone() {
            TokenKind::True => {
                self.bump()?;
                Ok(Rc::new(ConstExpression::new(Node::Boolean(true))))
            }
            TokenKind::False => {
                self.bump()?;
                Ok(Rc::new(ConstExpression::new(Node::Boolean(false))))
            }
            TokenKind::In => {
                self.bump()?;
                self.in_node_used = true;
                Ok(Rc::new(InNodeExpression))
            }
            TokenKind::Integer(value) => {
                self.bump()?;
                Ok(Rc::new(ConstExpression::new(Node::Integer(value))))
            }
            TokenKind::Minus => {
                self.bump()?;
                match self.token.kind.clone() {
                    TokenKind::Integer(value) => {
                        self.bump()?;
                        let value = value.checked_neg().ok_or_else(|| {
                            self.error("integer literal out of range")
                        })?;
                        Ok(Rc::new(ConstExpression::new(Node::Integer(value))))
                    }
                    _ => Err(self.error("expected an integer literal after `-`")),
                }
            }
            TokenKind::Identifier(name) => {
                let index = self
                    .param_names
                    .iter()
                    .position(|param| param == &name)
                    .ok_or_else(|| self.error(&format!("unknown identifier `{name}`")))?;
                self.bump()?;
                Ok(Rc::new(ParamExpression::new(index)))
            }
            TokenKind::Dot => {
                self.bump()?;
                let name = self.expect_identifier()?;
                Ok(Rc::new(ScopeMemberExpression::new(Node::string(name))))
            }
            TokenKind::LParen => {
                self.bump()?;
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            _ => Err(self.error("expected an expression")),
        }
    }
}

fn empty_transform() -> XformRef {
    Rc::new(InputlessTransform::new(Rc::new(ConstExpression::new(
        Node::empty_internal(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use bithenge_tree::blob_from_data;

    fn apply(script: &str, input: &[u8]) -> Result<Node> {
        let main = parse_script("test.bh", script)?;
        let scope = Scope::new(None);
        main.apply(&scope, &blob_from_data(input))
    }

    fn syntax_message(script: &str) -> String {
        match parse_script("test.bh", script) {
            Err(Error::Syntax(message)) => message,
            Ok(_) => panic!("expected a syntax error, got Ok"),
            Err(other) => panic!("expected a syntax error, got {other}"),
        }
    }

    #[test]
    fn simple_definition_applies() {
        let out = apply("transform main = uint8;", &[7]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 7);
    }

    #[test]
    fn definitions_see_earlier_definitions() {
        let out = apply(
            "transform byte = uint8;\ntransform main = byte;",
            &[9],
        )
        .unwrap();
        assert_eq!(out.as_integer().unwrap(), 9);
    }

    #[test]
    fn parameterized_definitions_wrap_arguments() {
        let out = apply(
            "transform take(n) = known_length(n);\n\
             transform main = take(2);",
            &[1, 2],
        )
        .unwrap();
        assert_eq!(out.as_blob().unwrap().size().unwrap(), 2);
    }

    #[test]
    fn arity_mismatches_are_parse_errors() {
        let message = syntax_message("transform main = known_length;");
        assert!(message.contains("takes 1 parameter(s), not 0"), "{message}");
        let message = syntax_message("transform main = uint8(1);");
        assert!(message.contains("takes 0 parameter(s), not 1"), "{message}");
    }

    #[test]
    fn unknown_names_are_parse_errors() {
        let message = syntax_message("transform main = no_such_thing;");
        assert!(message.contains("unknown transform"), "{message}");
        // Later definitions are not visible earlier.
        let message =
            syntax_message("transform main = later;\ntransform later = uint8;");
        assert!(message.contains("unknown transform"), "{message}");
    }

    #[test]
    fn errors_carry_file_line_and_column() {
        let message = syntax_message("transform main =\n  42;");
        assert!(message.starts_with("test.bh:2:3"), "{message}");
    }

    #[test]
    fn missing_main_is_an_error() {
        let message = syntax_message("transform not_main = uint8;");
        assert!(message.contains("no `main` transform"), "{message}");
    }

    #[test]
    fn expression_transforms_depend_on_in_usage() {
        // References `in`, so it decodes the input blob.
        let out = apply("transform main = (in[0]);", &[0xfe]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 0xfe);
        // No `in`: consumes nothing, so the input must be empty.
        let out = apply("transform main = (1 + 2);", &[]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 3);
        let err = apply("transform main = (1 + 2);", &[1]).unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn negative_literals_parse_in_expression_position() {
        let out = apply("transform main = (0 - -3);", &[]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 3);
    }

    #[test]
    fn operator_precedence_matches_the_grammar() {
        let out = apply("transform main = (1 + 2 * 3);", &[]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 7);
        let out = apply("transform main = (7 // 2 + 1);", &[]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 4);
        let out = apply("transform main = (1 + 1 == 2 && 2 < 3);", &[]).unwrap();
        assert!(out.as_boolean().unwrap());
    }

    #[test]
    fn parameters_resolve_by_name() {
        let out = apply(
            "transform pick(a, b) = known_length(a + b);\n\
             transform main = pick(1, 2);",
            &[1, 2, 3],
        )
        .unwrap();
        assert_eq!(out.as_blob().unwrap().size().unwrap(), 3);
    }

    #[test]
    fn barrier_blocks_member_lookup_inside_named_transforms() {
        // `.len` inside `inner` must not see the caller's struct.
        let err = apply(
            "transform inner = known_length(.len);\n\
             transform main = struct { .len <- uint8; .body <- inner; };",
            &[1, 2],
        )
        .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn do_while_parses_and_runs() {
        let out = apply(
            "transform main = do { struct { .v <- uint8; } } while (.v != 0);",
            &[1, 0],
        )
        .unwrap();
        let first = out.get(&Node::Integer(0)).unwrap();
        assert_eq!(
            first
                .get(&Node::string("v"))
                .unwrap()
                .as_integer()
                .unwrap(),
            1
        );
        assert_eq!(out.get(&Node::Integer(2)).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn partial_with_offset_skips_input() {
        let out = apply("transform main = partial(1) { uint8 };", &[0xaa, 0xbb]).unwrap();
        assert_eq!(out.as_integer().unwrap(), 0xbb);
    }

    #[test]
    fn concat_expression_builds_a_blob() {
        let out = apply(
            "transform main = (in[0, 1] ++ in[1, 1]);",
            &[0x61, 0x62],
        )
        .unwrap();
        let blob = out.as_blob().unwrap();
        assert_eq!(blob.size().unwrap(), 2);
        let mut buf = [0u8; 2];
        blob.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"ab");
    }
}
