//! Recursive-descent SQL parser.
//!
//! Single pass, no AST: each rule appends table instances, column
//! instances and range nodes straight into the [`Query`] plan. SELECT
//! parses its table list before its column list so that column-to-table
//! resolution has every candidate in hand; the parser saves the token
//! cursor at the start of the column list (`redo`) and re-scans it once
//! the tables are known.

use stampdb_primitives::ColId;

use super::lex::{self, Lexer, Token};
use super::types::{DataType, OpId};
use crate::db::schema::SchemaSnapshot;
use crate::error::{DBError, Loc, Result};
use crate::query::{
    ColDefSpec, ColIFlags, ColInst, DdlSpec, Query, QueryFlags, QueryOp, RangeNode, RangeRhs,
    TableInst,
};

/// Parse one SQL statement against the visible schema.
pub fn parse(sql: &[u8], snap: &SchemaSnapshot) -> Result<Query> {
    Parser::new(sql, snap)?.statement()
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    t: Token,
    snap: &'a SchemaSnapshot,
}

/// One side of a comparison.
enum Operand {
    Col(usize),
    Const(Option<Vec<u8>>),
}

impl<'a> Parser<'a> {
    fn new(sql: &'a [u8], snap: &'a SchemaSnapshot) -> Result<Parser<'a>> {
        let (lexer, sof) = Lexer::new(sql);
        let mut p = Parser {
            lexer,
            t: sof,
            snap,
        };
        p.advance()?;
        Ok(p)
    }

    fn advance(&mut self) -> Result<Token> {
        let prev = self.t;
        self.t = self.lexer.next(&self.t);
        if let Some(code) = self.t.error_code() {
            return Err(self.lex_error(code));
        }
        Ok(prev)
    }

    fn lex_error(&self, code: i32) -> DBError {
        let loc = self.t.loc();
        match code {
            -31 => DBError::UnrecognizedKeyword(loc),
            -32 => DBError::UnterminatedString(loc),
            -33 => DBError::UnexpectedToken(loc),
            _ => DBError::ParseError(loc),
        }
    }

    fn expect(&mut self, ty: u32, err: fn(Loc) -> DBError) -> Result<Token> {
        if self.t.ty != ty {
            return Err(err(self.t.loc()));
        }
        self.advance()
    }

    fn text(&self, t: &Token) -> &'a str {
        self.lexer.text(t)
    }

    /// The statement terminator: optional `;`, then end of input.
    fn finish(&mut self, q: Query) -> Result<Query> {
        if self.t.ty == lex::TOK_SEMI {
            self.advance()?;
        }
        if !self.t.is_eof() {
            return Err(DBError::UnexpectedToken(self.t.loc()));
        }
        Ok(q)
    }

    fn statement(&mut self) -> Result<Query> {
        match self.t.ty {
            lex::TOK_SELECT => self.select_like(QueryOp::Select),
            lex::TOK_COUNT => self.select_like(QueryOp::Count),
            lex::TOK_HISTORY => self.select_like(QueryOp::History),
            lex::TOK_INSERT => self.insert(),
            lex::TOK_DELETE => self.delete(),
            lex::TOK_UPDATE => self.update(QueryOp::Update),
            lex::TOK_CLONE => self.update(QueryOp::CloneRows),
            lex::TOK_CREATE => self.create_table(),
            lex::TOK_ALTER => self.alter_table(),
            lex::TOK_DROP => self.drop_table(),
            _ => Err(DBError::UnrecognizedKeyword(self.t.loc())),
        }
    }

    // -- table specs ----------------------------------------------------

    /// `tab := schema.name ['=' alias]`
    fn table_spec(&mut self, q: &mut Query) -> Result<usize> {
        if self.t.ty != lex::TOK_ID {
            return Err(DBError::ExpectedTable(self.t.loc()));
        }
        let loc = self.t.loc();
        let name = self.text(&self.t).to_owned();
        self.advance()?;

        let (schema, table) = match name.split_once('.') {
            Some((s, t)) if !t.contains('.') => (s.to_owned(), t.to_owned()),
            Some(_) => return Err(DBError::ExpectedTable(loc)),
            None => return Err(DBError::NoDefaultSchema(loc)),
        };

        let mut alias = table.clone();
        if self.t.ty == lex::TOK_EQ {
            self.advance()?;
            if self.t.ty != lex::TOK_ID {
                return Err(DBError::ExpectedId(self.t.loc()));
            }
            alias = self.text(&self.t).to_owned();
            self.advance()?;
        }

        let (vtable, file) = match self.snap.table(&schema, &table) {
            Some(def) => (def.vtable, def.file.clone()),
            None if matches!(q.op, QueryOp::CreateTable) => Default::default(),
            None => {
                return Err(DBError::TableNotFound(loc, format!("{schema}.{table}")));
            }
        };
        q.tables.push(TableInst {
            schema,
            name: table,
            alias,
            vtable,
            file,
            loc,
        });
        Ok(q.tables.len() - 1)
    }

    fn table_list(&mut self, q: &mut Query) -> Result<()> {
        loop {
            self.table_spec(q)?;
            if self.t.ty != lex::TOK_COMMA {
                return Ok(());
            }
            self.advance()?;
        }
    }

    // -- column references ----------------------------------------------

    /// Resolve `name` (possibly `alias.col` or a `__special`) against the
    /// query's table instances. Creates or reuses a [`ColInst`].
    fn resolve_col(&mut self, q: &mut Query, name: &str, loc: Loc) -> Result<usize> {
        let (ti, col_name) = match name.rsplit_once('.') {
            Some((alias, col)) => {
                let ti = q
                    .tables
                    .iter()
                    .position(|t| t.alias == alias || t.name == alias)
                    .ok_or_else(|| DBError::TableNotFound(loc, alias.to_owned()))?;
                (ti, col)
            }
            None => {
                if name.starts_with("__") {
                    (0, name)
                } else {
                    let mut found = None;
                    for (i, _) in q.tables.iter().enumerate() {
                        if self.table_col(q, i, name).is_some() {
                            if found.is_some() {
                                return Err(DBError::ColumnNotFound(loc, name.to_owned()));
                            }
                            found = Some(i);
                        }
                    }
                    (
                        found.ok_or_else(|| DBError::ColumnNotFound(loc, name.to_owned()))?,
                        name,
                    )
                }
            }
        };

        if let Some(special) = special_col(col_name) {
            return Ok(self.intern_col(
                q,
                ti,
                col_name,
                special,
                DataType::Str,
                ColIFlags::SPECIAL,
                loc,
            ));
        }
        let def = self
            .table_col(q, ti, col_name)
            .ok_or_else(|| DBError::ColumnNotFound(loc, col_name.to_owned()))?;
        let (id, dtype, flags) = (def.id, def.dtype, def.flags);
        Ok(self.intern_col(q, ti, col_name, id, dtype, flags & (ColIFlags::KEY | ColIFlags::NOTNULL | ColIFlags::UNIQUE), loc))
    }

    fn table_col(&self, q: &Query, ti: usize, name: &str) -> Option<&crate::db::schema::ColDef> {
        let t = &q.tables[ti];
        self.snap.table(&t.schema, &t.name)?.col_by_name(name)
    }

    fn intern_col(
        &self,
        q: &mut Query,
        ti: usize,
        name: &str,
        id: ColId,
        dtype: DataType,
        flags: ColIFlags,
        loc: Loc,
    ) -> usize {
        if let Some(ci) = (0..q.cols.len()).find(|&i| q.cols[i].table == ti && q.cols[i].col_id == id)
        {
            return ci;
        }
        q.cols.push(ColInst {
            table: ti,
            name: name.to_owned(),
            col_id: id,
            dtype,
            flags,
            order_index: -1,
            const_val: None,
            loc,
        });
        q.cols.len() - 1
    }

    /// The SELECT/COUNT/HISTORY column list; `*` only when `wild`.
    fn column_list(&mut self, q: &mut Query, wild: bool) -> Result<()> {
        if self.t.ty == lex::TOK_STAR {
            if !wild {
                return Err(DBError::WildcardIllegal(self.t.loc()));
            }
            self.advance()?;
            for ti in 0..q.tables.len() {
                let t = &q.tables[ti];
                let Some(def) = self.snap.table(&t.schema, &t.name) else {
                    continue;
                };
                for col in def.cols.clone() {
                    let ci = self.intern_col(
                        q,
                        ti,
                        &col.name,
                        col.id,
                        col.dtype,
                        col.flags,
                        self.t.loc(),
                    );
                    q.cols[ci].flags.insert(ColIFlags::ORDER);
                    q.display.push(ci);
                }
            }
            return Ok(());
        }

        loop {
            if self.t.ty != lex::TOK_ID {
                return Err(DBError::ExpectedColumn(self.t.loc()));
            }
            let loc = self.t.loc();
            let name = self.text(&self.t).to_owned();
            self.advance()?;
            let ci = self.resolve_col(q, &name, loc)?;
            if q.display.contains(&ci) {
                return Err(DBError::DuplicateColumn(loc));
            }
            q.cols[ci].flags.insert(ColIFlags::ORDER);
            q.display.push(ci);
            if self.t.ty != lex::TOK_COMMA {
                return Ok(());
            }
            self.advance()?;
        }
    }

    // -- data items ------------------------------------------------------

    fn data_item(&mut self) -> Result<Option<Vec<u8>>> {
        match self.t.ty {
            lex::TOK_STRING | lex::TOK_DQSTRING => {
                let v = self.lexer.string_value(&self.t);
                self.advance()?;
                Ok(Some(v))
            }
            lex::TOK_INT | lex::TOK_REAL => {
                let v = self.text(&self.t).as_bytes().to_vec();
                self.advance()?;
                Ok(Some(v))
            }
            lex::TOK_NULL => {
                self.advance()?;
                Ok(None)
            }
            lex::TOK_DOLLAR => {
                // host variables are substituted by the embedded-SQL
                // preprocessor; at this level the reference is literal
                let v = self.text(&self.t).as_bytes().to_vec();
                self.advance()?;
                Ok(Some(v))
            }
            lex::TOK_OPAREN => Err(DBError::FeatureNotSupported(self.t.loc())),
            _ => Err(DBError::ExpectedData(self.t.loc())),
        }
    }

    fn is_data_start(&self) -> bool {
        matches!(
            self.t.ty,
            lex::TOK_STRING
                | lex::TOK_DQSTRING
                | lex::TOK_INT
                | lex::TOK_REAL
                | lex::TOK_NULL
                | lex::TOK_DOLLAR
        )
    }

    // -- WHERE ----------------------------------------------------------

    fn operand(&mut self, q: &mut Query) -> Result<(Operand, Loc)> {
        let loc = self.t.loc();
        if self.t.ty == lex::TOK_ID {
            let name = self.text(&self.t).to_owned();
            self.advance()?;
            return Ok((Operand::Col(self.resolve_col(q, &name, loc)?), loc));
        }
        if self.is_data_start() {
            return Ok((Operand::Const(self.data_item()?), loc));
        }
        Err(DBError::ExpectedData(loc))
    }

    fn operator(&mut self) -> Result<OpId> {
        let op = match self.t.ty {
            lex::TOK_EQ => OpId::EqEq,
            lex::TOK_LT => OpId::Lt,
            lex::TOK_LTEQ => OpId::LtEq,
            lex::TOK_GT => OpId::Gt,
            lex::TOK_GTEQ => OpId::GtEq,
            lex::TOK_NOTEQ => OpId::NotEq,
            lex::TOK_LIKE => OpId::Like,
            lex::TOK_SAME => OpId::Same,
            _ => return Err(DBError::ExpectedOperator(self.t.loc())),
        };
        self.advance()?;
        Ok(op)
    }

    /// `expr := data op data (AND data op data)*`
    fn where_clause(&mut self, q: &mut Query) -> Result<()> {
        loop {
            let (lhs, lloc) = self.operand(q)?;
            let op = self.operator()?;
            let (rhs, rloc) = self.operand(q)?;

            let node = match (lhs, rhs) {
                (Operand::Const(_), Operand::Const(_)) => {
                    return Err(DBError::CannotHaveTwoConsts(rloc));
                }
                (Operand::Col(c), Operand::Const(v)) => RangeNode {
                    col: c,
                    op,
                    rhs: RangeRhs::Const(v),
                    loc: lloc,
                },
                (Operand::Const(v), Operand::Col(c)) => RangeNode {
                    col: c,
                    op: mirror_op(op),
                    rhs: RangeRhs::Const(v),
                    loc: rloc,
                },
                (Operand::Col(a), Operand::Col(b)) => RangeNode {
                    col: a,
                    op,
                    rhs: RangeRhs::Col(b),
                    loc: lloc,
                },
            };
            q.ranges.push(node);

            if self.t.ty != lex::TOK_AND {
                return Ok(());
            }
            self.advance()?;
        }
    }

    fn optional_where(&mut self, q: &mut Query, required: bool) -> Result<()> {
        if self.t.ty == lex::TOK_WHERE {
            self.advance()?;
            self.where_clause(q)
        } else if required {
            Err(DBError::MissingWhere(self.t.loc()))
        } else {
            Ok(())
        }
    }

    // -- SELECT / COUNT / HISTORY ---------------------------------------

    fn select_like(&mut self, op: QueryOp) -> Result<Query> {
        let mut q = Query::new(op);
        if op == QueryOp::History {
            q.flags.insert(QueryFlags::RETURN_ALL);
        }
        self.advance()?;

        // Save the column-list cursor, skim ahead to FROM, parse the
        // table list, then come back for the columns.
        let redo = self.t;
        if self.t.ty == lex::TOK_FROM {
            return Err(DBError::ExpectedColumn(self.t.loc()));
        }
        while self.t.ty != lex::TOK_FROM {
            if self.t.is_eof() {
                return Err(DBError::ExpectedTable(self.t.loc()));
            }
            self.advance()?;
        }
        self.advance()?; // FROM
        self.table_list(&mut q)?;
        let cont = self.t;

        self.t = redo;
        self.column_list(&mut q, true)?;
        if self.t.ty != lex::TOK_FROM {
            return Err(DBError::UnexpectedToken(self.t.loc()));
        }

        self.t = cont;
        self.optional_where(&mut q, false)?;
        if self.t.ty == lex::TOK_ORDER {
            self.advance()?;
            self.expect(lex::TOK_BY, DBError::UnexpectedToken)?;
            self.order_by(&mut q)?;
        }
        if self.t.ty == lex::TOK_LIMIT {
            self.advance()?;
            self.limit(&mut q)?;
        }
        finalize_order_indexes(&mut q);
        self.finish(q)
    }

    fn order_by(&mut self, q: &mut Query) -> Result<()> {
        q.flags.insert(QueryFlags::WITH_ORDER);
        loop {
            if self.t.ty != lex::TOK_ID {
                return Err(DBError::ExpectedColumn(self.t.loc()));
            }
            let loc = self.t.loc();
            let name = self.text(&self.t).to_owned();
            self.advance()?;
            let ci = self.resolve_col(q, &name, loc)?;
            q.cols[ci].flags.insert(ColIFlags::SORTORDER);
            if self.t.ty == lex::TOK_DESC {
                q.cols[ci].flags.insert(ColIFlags::SORTDESC);
                self.advance()?;
            }
            q.sort.push(ci);
            if self.t.ty != lex::TOK_COMMA {
                return Ok(());
            }
            self.advance()?;
        }
    }

    fn limit(&mut self, q: &mut Query) -> Result<()> {
        q.flags.insert(QueryFlags::WITH_LIMIT);
        if self.t.ty != lex::TOK_INT {
            return Err(DBError::ExpectedData(self.t.loc()));
        }
        let a: i32 = self.text(&self.t).parse().unwrap_or(0);
        self.advance()?;
        if self.t.ty == lex::TOK_COMMA {
            self.advance()?;
            if self.t.ty != lex::TOK_INT {
                return Err(DBError::ExpectedData(self.t.loc()));
            }
            let b: i32 = self.text(&self.t).parse().unwrap_or(0);
            self.advance()?;
            q.start_row = a;
            q.max_rows = b;
        } else {
            q.max_rows = a;
        }
        Ok(())
    }

    // -- INSERT ----------------------------------------------------------

    fn insert(&mut self) -> Result<Query> {
        let mut q = Query::new(QueryOp::Insert);
        self.advance()?;
        self.expect(lex::TOK_INTO, DBError::UnexpectedToken)?;
        self.table_spec(&mut q)?;

        self.expect(lex::TOK_OPAREN, |l| DBError::MustDeclareCols(l))?;
        let mut cols = Vec::new();
        loop {
            if self.t.ty != lex::TOK_ID {
                return Err(DBError::ExpectedColumn(self.t.loc()));
            }
            let loc = self.t.loc();
            let name = self.text(&self.t).to_owned();
            self.advance()?;
            let ci = self.resolve_col(&mut q, &name, loc)?;
            if cols.contains(&ci) {
                return Err(DBError::DuplicateColumn(loc));
            }
            cols.push(ci);
            if self.t.ty != lex::TOK_COMMA {
                break;
            }
            self.advance()?;
        }
        self.expect(lex::TOK_CPAREN, DBError::UnexpectedToken)?;
        self.expect(lex::TOK_VALUES, DBError::UnexpectedToken)?;
        self.expect(lex::TOK_OPAREN, DBError::UnexpectedToken)?;

        let mut i = 0;
        loop {
            let loc = self.t.loc();
            let v = self.data_item()?;
            if i >= cols.len() {
                return Err(DBError::TooMuchData(loc));
            }
            q.cols[cols[i]].const_val = Some(v);
            q.cols[cols[i]].flags.insert(ColIFlags::ORDER);
            q.display.push(cols[i]);
            i += 1;
            if self.t.ty != lex::TOK_COMMA {
                break;
            }
            self.advance()?;
        }
        if i < cols.len() {
            return Err(DBError::TooLittleData(self.t.loc()));
        }
        self.expect(lex::TOK_CPAREN, DBError::UnexpectedToken)?;
        self.finish(q)
    }

    // -- DELETE ----------------------------------------------------------

    fn delete(&mut self) -> Result<Query> {
        let mut q = Query::new(QueryOp::Delete);
        self.advance()?;
        self.expect(lex::TOK_FROM, DBError::UnexpectedToken)?;
        self.table_spec(&mut q)?;
        self.optional_where(&mut q, true)?;
        self.finish(q)
    }

    // -- UPDATE / CLONE --------------------------------------------------

    fn update(&mut self, op: QueryOp) -> Result<Query> {
        let mut q = Query::new(op);
        self.advance()?;
        self.table_list(&mut q)?;
        self.expect(lex::TOK_SET, DBError::UnexpectedToken)?;

        loop {
            if self.t.ty != lex::TOK_ID {
                return Err(DBError::ExpectedColumn(self.t.loc()));
            }
            let loc = self.t.loc();
            let name = self.text(&self.t).to_owned();
            self.advance()?;
            let ci = self.resolve_col(&mut q, &name, loc)?;
            self.expect(lex::TOK_EQ, DBError::ExpectedOperator)?;
            let v = self.data_item()?;
            if q.cols[ci].const_val.is_some() {
                return Err(DBError::DuplicateColumn(loc));
            }
            q.cols[ci].const_val = Some(v);
            q.cols[ci].flags.insert(ColIFlags::ORDER);
            q.display.push(ci);
            if self.t.ty != lex::TOK_COMMA {
                break;
            }
            self.advance()?;
        }
        self.optional_where(&mut q, true)?;
        self.finish(q)
    }

    // -- DDL -------------------------------------------------------------

    fn coldef(&mut self) -> Result<ColDefSpec> {
        if self.t.ty != lex::TOK_ID {
            return Err(DBError::ExpectedColumn(self.t.loc()));
        }
        let loc = self.t.loc();
        let name = self.text(&self.t).to_owned();
        self.advance()?;

        if !matches!(self.t.ty, lex::TOK_ID | lex::TOK_DATA) {
            return Err(DBError::UnrecognizedType(self.t.loc()));
        }
        let tloc = self.t.loc();
        let tname = self.text(&self.t).to_owned();
        self.advance()?;
        let dtype = DataType::parse(&tname).ok_or(DBError::UnrecognizedType(tloc))?;

        let mut flags = ColIFlags::empty();
        let mut default = None;
        loop {
            match self.t.ty {
                lex::TOK_NOT => {
                    self.advance()?;
                    self.expect(lex::TOK_NULL, DBError::UnexpectedToken)?;
                    flags.insert(ColIFlags::NOTNULL);
                }
                lex::TOK_PRIMARY => {
                    self.advance()?;
                    self.expect(lex::TOK_KEY, DBError::UnexpectedToken)?;
                    if flags.contains(ColIFlags::UNIQUE) {
                        return Err(DBError::NotBothUniquePrimary(loc));
                    }
                    flags.insert(ColIFlags::KEY);
                }
                lex::TOK_UNIQUE => {
                    if flags.contains(ColIFlags::KEY) {
                        return Err(DBError::NotBothUniquePrimary(self.t.loc()));
                    }
                    flags.insert(ColIFlags::UNIQUE);
                    self.advance()?;
                }
                lex::TOK_DEFAULT => {
                    let dloc = self.t.loc();
                    self.advance()?;
                    if default.is_some() {
                        return Err(DBError::DuplicateDefault(dloc));
                    }
                    default = Some(self.data_item()?.unwrap_or_default());
                    flags.insert(ColIFlags::HASDEFAULT);
                }
                _ => break,
            }
        }
        Ok(ColDefSpec {
            name,
            dtype,
            flags,
            default,
            loc,
        })
    }

    fn create_table(&mut self) -> Result<Query> {
        let mut q = Query::new(QueryOp::CreateTable);
        self.advance()?;
        self.expect(lex::TOK_TABLE, DBError::UnexpectedToken)?;
        let ti = self.table_spec(&mut q)?;
        {
            let t = &q.tables[ti];
            if self.snap.table(&t.schema, &t.name).is_some() {
                return Err(DBError::TableExists(t.loc, t.qualified()));
            }
        }
        self.expect(lex::TOK_OPAREN, DBError::UnexpectedToken)?;
        let mut cols: Vec<ColDefSpec> = Vec::new();
        loop {
            let def = self.coldef()?;
            if cols.iter().any(|c| c.name == def.name) {
                return Err(DBError::DuplicateColumn(def.loc));
            }
            cols.push(def);
            if self.t.ty != lex::TOK_COMMA {
                break;
            }
            self.advance()?;
        }
        self.expect(lex::TOK_CPAREN, DBError::UnexpectedToken)?;
        q.ddl = Some(DdlSpec::CreateTable { cols });
        self.finish(q)
    }

    fn alter_table(&mut self) -> Result<Query> {
        let mut q = Query::new(QueryOp::AlterTable);
        self.advance()?;
        self.expect(lex::TOK_TABLE, DBError::UnexpectedToken)?;
        let ti = self.table_spec(&mut q)?;
        let def = {
            let t = &q.tables[ti];
            self.snap
                .table(&t.schema, &t.name)
                .ok_or_else(|| DBError::TableNotFound(t.loc, t.qualified()))?
                .clone()
        };

        match self.t.ty {
            lex::TOK_ADD => {
                self.advance()?;
                if self.t.ty == lex::TOK_COLUMN {
                    self.advance()?;
                }
                let col = self.coldef()?;
                if def.col_by_name(&col.name).is_some() {
                    return Err(DBError::ColumnExists(col.loc, col.name));
                }
                q.ddl = Some(DdlSpec::AlterAddColumn { col });
            }
            lex::TOK_DROP => {
                self.advance()?;
                if self.t.ty == lex::TOK_COLUMN {
                    self.advance()?;
                }
                if self.t.ty != lex::TOK_ID {
                    return Err(DBError::ExpectedColumn(self.t.loc()));
                }
                let loc = self.t.loc();
                let name = self.text(&self.t).to_owned();
                self.advance()?;
                if def.col_by_name(&name).is_none() {
                    return Err(DBError::ColumnNotFound(loc, name));
                }
                q.ddl = Some(DdlSpec::AlterDropColumn { name, loc });
            }
            _ => return Err(DBError::UnexpectedToken(self.t.loc())),
        }
        self.finish(q)
    }

    fn drop_table(&mut self) -> Result<Query> {
        let mut q = Query::new(QueryOp::DropTable);
        self.advance()?;
        self.expect(lex::TOK_TABLE, DBError::UnexpectedToken)?;
        let ti = self.table_spec(&mut q)?;
        {
            let t = &q.tables[ti];
            if self.snap.table(&t.schema, &t.name).is_none() {
                return Err(DBError::TableNotFound(t.loc, t.qualified()));
            }
        }
        q.ddl = Some(DdlSpec::DropTable);
        self.finish(q)
    }
}

/// Swap the operand sides of an operator (`const op col` normalization).
fn mirror_op(op: OpId) -> OpId {
    match op {
        OpId::Lt => OpId::Gt,
        OpId::LtEq => OpId::GtEq,
        OpId::Gt => OpId::Lt,
        OpId::GtEq => OpId::LtEq,
        OpId::Like => OpId::RLike,
        OpId::Same => OpId::RSame,
        OpId::EqEq | OpId::NotEq => op,
        OpId::RLike => OpId::Like,
        OpId::RSame => OpId::Same,
    }
}

/// Assign each sort column its position within the result row: display
/// columns keep their display position, hidden sort keys are appended.
fn finalize_order_indexes(q: &mut Query) {
    for (i, &ci) in q.display.iter().enumerate() {
        q.cols[ci].order_index = i as i32;
    }
    let mut next = q.display.len() as i32;
    for &ci in &q.sort {
        if q.cols[ci].order_index < 0 {
            q.cols[ci].order_index = next;
            next += 1;
        }
    }
}

/// Map a `__name` pseudo-column onto its system column id.
fn special_col(name: &str) -> Option<ColId> {
    match name {
        "__timestamp" => Some(ColId::STAMP),
        "__userid" => Some(ColId::USERID),
        "__vtid" => Some(ColId::VTID),
        "__opcode" => Some(ColId::OPCODE),
        _ => None,
    }
}
