//! Recursive-descent parser for script bodies.
//!
//! Produces the expression tree in `ast`. Nesting, string literals and
//! bracket balance are handled structurally by the grammar; there is no
//! string-level bracket counting anywhere.

use crate::dsl::ast::{BinOp, Block, Expr, FnBody, FnDecl, Stmt, UnOp};
use crate::dsl::lexer::{tokenize, Tok, Token};
use crate::error::ParseError;

pub struct Parser {
    toks: Vec<Token>,
    pos: usize,
    end: usize,
}

/// Parse a lifecycle body (statement list).
pub fn parse_body(src: &str) -> Result<Block, ParseError> {
    let mut p = Parser::new(src)?;
    let block = p.block_until_end()?;
    Ok(block)
}

/// Parse a single expression; trailing input is an error.
pub fn parse_expr(src: &str) -> Result<Expr, ParseError> {
    let mut p = Parser::new(src)?;
    let expr = p.expr()?;
    if !p.at_end() {
        return Err(p.err_here("unexpected input after expression"));
    }
    Ok(expr)
}

impl Parser {
    pub fn new(src: &str) -> Result<Self, ParseError> {
        let toks = tokenize(src)?;
        Ok(Self {
            toks,
            pos: 0,
            end: src.len(),
        })
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.toks.get(self.pos + n).map(|t| &t.tok)
    }

    fn here(&self) -> usize {
        self.toks.get(self.pos).map(|t| t.pos).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|t| t.tok.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ParseError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {}", what)))
        }
    }

    fn err_here(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.here())
    }

    // ---- statements ----

    fn block_until_end(&mut self) -> Result<Block, ParseError> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            if self.eat(&Tok::Semi) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        Ok(Block { stmts })
    }

    fn braced_block(&mut self) -> Result<Block, ParseError> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        loop {
            if self.eat(&Tok::RBrace) {
                break;
            }
            if self.at_end() {
                return Err(self.err_here("expected '}'"));
            }
            if self.eat(&Tok::Semi) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        Ok(Block { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            Some(Tok::Static) => {
                self.advance();
                self.expect(Tok::Var, "'var' after 'static'")?;
                let name = self.ident("static variable name")?;
                self.expect(Tok::Assign, "'='")?;
                let expr = self.expr()?;
                Ok(Stmt::StaticVar { name, expr })
            }
            Some(Tok::Var) | Some(Tok::Let) => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(Tok::Assign, "'='")?;
                let expr = self.expr()?;
                Ok(Stmt::Var { name, expr })
            }
            Some(Tok::If) => self.if_statement(),
            Some(Tok::Function) => {
                self.advance();
                self.fn_decl().map(Stmt::FnDecl)
            }
            Some(Tok::Reserved(word)) => {
                let word = *word;
                Err(self.err_here(format!("'{}' is not supported", word)))
            }
            _ => {
                if let Some(decl) = self.try_fn_decl()? {
                    return Ok(Stmt::FnDecl(decl));
                }
                // assignment or expression statement
                if let (Some(Tok::Ident(_)), Some(Tok::Assign)) = (self.peek(), self.peek_at(1)) {
                    let name = self.ident("identifier")?;
                    self.advance(); // '='
                    let expr = self.expr()?;
                    return Ok(Stmt::Assign { name, expr });
                }
                let expr = self.expr()?;
                if self.eat(&Tok::Assign) {
                    return match expr {
                        Expr::Index { target, index } => Ok(Stmt::IndexAssign {
                            target: *target,
                            index: *index,
                            expr: self.expr()?,
                        }),
                        _ => Err(self.err_here("cannot assign to this expression")),
                    };
                }
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect(Tok::If, "'if'")?;
        self.expect(Tok::LParen, "'('")?;
        let cond = self.expr()?;
        self.expect(Tok::RParen, "')'")?;
        let then = self.braced_block()?;
        let other = if self.eat(&Tok::Else) {
            if self.peek() == Some(&Tok::If) {
                let nested = self.if_statement()?;
                Some(Block {
                    stmts: vec![nested],
                })
            } else {
                Some(self.braced_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If { cond, then, other })
    }

    /// Detect a function declaration at the cursor: `name(params)`
    /// followed by `{` or `=>`. Rewinds and returns None otherwise.
    /// Reserved control-flow words are lexed as keywords, so they can
    /// never be taken as a function name here.
    fn try_fn_decl(&mut self) -> Result<Option<FnDecl>, ParseError> {
        if !matches!(self.peek(), Some(Tok::Ident(_))) || self.peek_at(1) != Some(&Tok::LParen) {
            return Ok(None);
        }
        // scan ahead over the parameter list without consuming
        let mut n = 2;
        loop {
            match self.peek_at(n) {
                Some(Tok::RParen) => break,
                Some(Tok::Ident(_)) => {
                    n += 1;
                    match self.peek_at(n) {
                        Some(Tok::Comma) => n += 1,
                        Some(Tok::RParen) => break,
                        _ => return Ok(None),
                    }
                }
                _ => return Ok(None),
            }
        }
        match self.peek_at(n + 1) {
            Some(Tok::LBrace) | Some(Tok::Arrow) => self.fn_decl().map(Some),
            _ => Ok(None),
        }
    }

    fn fn_decl(&mut self) -> Result<FnDecl, ParseError> {
        let name = self.ident("function name")?;
        self.expect(Tok::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(Tok::Comma, "',' or ')'")?;
            }
        }
        let body = if self.eat(&Tok::Arrow) {
            if self.peek() == Some(&Tok::LBrace) {
                FnBody::Block(self.braced_block()?)
            } else {
                FnBody::Expr(self.expr()?)
            }
        } else {
            FnBody::Block(self.braced_block()?)
        };
        Ok(FnDecl { name, params, body })
    }

    fn ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(Tok::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.err_here(format!("expected {}", what))),
        }
    }

    // ---- expressions (precedence climbing) ----

    pub fn expr(&mut self) -> Result<Expr, ParseError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.logic_or()?;
        if self.eat(&Tok::Question) {
            let then = self.expr()?;
            self.expect(Tok::Colon, "':'")?;
            let other = self.expr()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                other: Box::new(other),
            });
        }
        Ok(cond)
    }

    fn logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.logic_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.logic_and()?;
            lhs = bin(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.equality()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.equality()?;
            lhs = bin(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Eq) => BinOp::Eq,
                Some(Tok::Ne) => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.relational()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.additive()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(self.unary()?),
            });
        }
        if self.eat(&Tok::Bang) {
            return Ok(Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(self.unary()?),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Tok::LBracket) => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(Tok::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Tok::Dot) => {
                    self.advance();
                    let field = self.ident("field name")?;
                    expr = Expr::Member {
                        target: Box::new(expr),
                        field,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.here();
        match self.advance() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::True) => Ok(Expr::Bool(true)),
            Some(Tok::False) => Ok(Expr::Bool(false)),
            Some(Tok::Null) => Ok(Expr::Na),
            Some(Tok::Ident(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.eat(&Tok::RParen) {
                                break;
                            }
                            self.expect(Tok::Comma, "',' or ')'")?;
                        }
                    }
                    Ok(Expr::call(name, args, pos))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Tok::LParen) => {
                let expr = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(expr)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                        self.expect(Tok::Comma, "',' or ']'")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Tok::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Tok::Ident(s)) => s,
                            Some(Tok::Str(s)) => s,
                            _ => return Err(ParseError::new("expected map key", pos)),
                        };
                        self.expect(Tok::Colon, "':'")?;
                        entries.push((key, self.expr()?));
                        if self.eat(&Tok::RBrace) {
                            break;
                        }
                        self.expect(Tok::Comma, "',' or '}'")?;
                    }
                }
                Ok(Expr::Map(entries))
            }
            Some(other) => Err(ParseError::new(
                format!("unexpected token {:?}", other),
                pos,
            )),
            None => Err(ParseError::new("unexpected end of input", pos)),
        }
    }
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::ast::CallTarget;

    #[test]
    fn parse_var_decl() {
        let block = parse_body("var x = 1 + 2").unwrap();
        assert_eq!(block.stmts.len(), 1);
        match &block.stmts[0] {
            Stmt::Var { name, expr } => {
                assert_eq!(name, "x");
                assert!(matches!(expr, Expr::Binary { op: BinOp::Add, .. }));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_with_index() {
        let expr = parse_expr("sma(close, 14)[1]").unwrap();
        match expr {
            Expr::Index { target, index } => {
                assert!(matches!(*index, Expr::Num(n) if n == 1.0));
                match *target {
                    Expr::Call(call) => {
                        assert_eq!(call.name, "sma");
                        assert_eq!(call.args.len(), 2);
                        assert_eq!(call.target, CallTarget::Unresolved);
                    }
                    other => panic!("expected call, got {:?}", other),
                }
            }
            other => panic!("expected index, got {:?}", other),
        }
    }

    #[test]
    fn precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let expr = parse_expr("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary {
                op: BinOp::Add,
                rhs,
                ..
            } => assert!(matches!(*rhs, Expr::Binary { op: BinOp::Mul, .. })),
            other => panic!("expected add at top, got {:?}", other),
        }
    }

    #[test]
    fn logical_and_comparison() {
        let expr = parse_expr("a > 1 && b <= 2 || !c").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinOp::Or, .. }));
    }

    #[test]
    fn ternary() {
        let expr = parse_expr("cond ? 1 : x[2]").unwrap();
        assert!(matches!(expr, Expr::Ternary { .. }));
    }

    #[test]
    fn if_else_chain() {
        let block = parse_body(
            "if (x > 0) { var a = 1 } else if (x < 0) { var a = 2 } else { var a = 3 }",
        )
        .unwrap();
        match &block.stmts[0] {
            Stmt::If { other, .. } => {
                let nested = other.as_ref().unwrap();
                assert!(matches!(nested.stmts[0], Stmt::If { .. }));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn index_assignment() {
        let block = parse_body("s[0] = s[1] + 1").unwrap();
        assert!(matches!(block.stmts[0], Stmt::IndexAssign { .. }));
    }

    #[test]
    fn fn_decl_brace_form() {
        let block = parse_body("draw(ctx) { var a = 1 }").unwrap();
        match &block.stmts[0] {
            Stmt::FnDecl(f) => {
                assert_eq!(f.name, "draw");
                assert_eq!(f.params, vec!["ctx"]);
                assert!(matches!(f.body, FnBody::Block(_)));
            }
            other => panic!("expected fn decl, got {:?}", other),
        }
    }

    #[test]
    fn fn_decl_arrow_block_form() {
        let block = parse_body("yRange(hi, lo) => { var a = hi }").unwrap();
        match &block.stmts[0] {
            Stmt::FnDecl(f) => {
                assert_eq!(f.params, vec!["hi", "lo"]);
                assert!(matches!(f.body, FnBody::Block(_)));
            }
            other => panic!("expected fn decl, got {:?}", other),
        }
    }

    #[test]
    fn fn_decl_arrow_expr_form() {
        let block = parse_body("legend() => null").unwrap();
        match &block.stmts[0] {
            Stmt::FnDecl(f) => {
                assert_eq!(f.name, "legend");
                assert!(matches!(f.body, FnBody::Expr(Expr::Na)));
            }
            other => panic!("expected fn decl, got {:?}", other),
        }
    }

    #[test]
    fn fn_decl_with_function_keyword() {
        let block = parse_body("function meta() { var a = 1 }").unwrap();
        assert!(matches!(block.stmts[0], Stmt::FnDecl(_)));
    }

    #[test]
    fn reserved_word_is_not_a_fn_name() {
        assert!(parse_body("while(x) { var a = 1 }").is_err());
    }

    #[test]
    fn call_statement_is_not_a_fn_decl() {
        // argument is a number, so this must parse as a call
        let block = parse_body("chart(1)").unwrap();
        assert!(matches!(block.stmts[0], Stmt::Expr(Expr::Call(_))));
    }

    #[test]
    fn static_var() {
        let block = parse_body("static var K = 2 * 3").unwrap();
        match &block.stmts[0] {
            Stmt::StaticVar { name, .. } => assert_eq!(name, "K"),
            other => panic!("expected static var, got {:?}", other),
        }
    }

    #[test]
    fn map_and_list_literals() {
        let expr = parse_expr("{ def: 14, type: 'integer', opts: [1, 2] }").unwrap();
        match expr {
            Expr::Map(entries) => {
                assert_eq!(entries.len(), 3);
                assert_eq!(entries[0].0, "def");
                assert!(matches!(entries[2].1, Expr::List(_)));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn member_access() {
        let expr = parse_expr("btc.close[0]").unwrap();
        match expr {
            Expr::Index { target, .. } => {
                assert!(matches!(*target, Expr::Member { .. }));
            }
            other => panic!("expected index over member, got {:?}", other),
        }
    }

    #[test]
    fn error_unbalanced_paren() {
        let err = parse_expr("sma(close, 14").unwrap_err();
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn error_unbalanced_bracket_deeply_nested() {
        let err = parse_body("var x = f(g(h[i[0]])").unwrap_err();
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn error_trailing_input() {
        let err = parse_expr("1 + 2 garbage").unwrap_err();
        assert!(err.message.contains("unexpected input"));
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse() {
        let block = parse_body("var s = '}{)([' \n var y = 1").unwrap();
        assert_eq!(block.stmts.len(), 2);
    }

    #[test]
    fn semicolons_optional() {
        let a = parse_body("var x = 1; var y = 2;").unwrap();
        let b = parse_body("var x = 1\nvar y = 2").unwrap();
        assert_eq!(a, b);
    }
}
