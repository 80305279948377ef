//! The schema catalog.
//!
//! Schemas, tables and columns are ordinary records. `sys.dt0` carries
//! schema records (vtable 0x0002) and table records (vtable 0x0004); each
//! schema's physical file carries the column-definition records of its
//! tables in the odd meta vtable paired with the table's data vtable.
//! DDL therefore commits through the same two-phase path as DML, and a
//! schema snapshot is just a scan at the transaction's freeze stamp.

use std::collections::BTreeMap;

use stampdb_primitives::{ColId, VTableId};

use super::OwnedRecord;
use crate::query::{ColDefSpec, ColIFlags};
use crate::sql::types::DataType;

pub const VT_SYS_SCHEMA: VTableId = VTableId(0x0002);
pub const VT_SYS_TABLE: VTableId = VTableId(0x0004);
pub const FIRST_USER_VTABLE: u16 = 0x0400;

/// Schema record columns.
pub const C_SCM_NAME: ColId = ColId(0x0400);
pub const C_SCM_FILE: ColId = ColId(0x0401);

/// Table record columns.
pub const C_TAB_SCM: ColId = ColId(0x0400);
pub const C_TAB_NAME: ColId = ColId(0x0401);
pub const C_TAB_VTID: ColId = ColId(0x0402);
pub const C_TAB_FILE: ColId = ColId(0x0403);

/// Column-definition record columns (live in the table's meta vtable).
pub const C_COL_NAME: ColId = ColId(0x0400);
pub const C_COL_ID: ColId = ColId(0x0401);
pub const C_COL_TYPE: ColId = ColId(0x0402);
pub const C_COL_FLAGS: ColId = ColId(0x0403);
pub const C_COL_DEFAULT: ColId = ColId(0x0404);

/// Flag bits that survive in a column-definition record.
const PERSISTED_COL_FLAGS: u32 =
    ColIFlags::KEY.bits() | ColIFlags::NOTNULL.bits() | ColIFlags::UNIQUE.bits();

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaDef {
    pub name: String,
    /// Physical file holding this schema's tables.
    pub file: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColDef {
    pub name: String,
    pub id: ColId,
    pub dtype: DataType,
    pub flags: ColIFlags,
    pub default: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    pub vtable: VTableId,
    pub file: String,
    pub cols: Vec<ColDef>,
}

impl TableDef {
    pub fn col_by_name(&self, name: &str) -> Option<&ColDef> {
        self.cols.iter().find(|c| c.name == name)
    }

    pub fn col_by_id(&self, id: ColId) -> Option<&ColDef> {
        self.cols.iter().find(|c| c.id == id)
    }

    pub fn key_cols(&self) -> Vec<&ColDef> {
        self.cols
            .iter()
            .filter(|c| c.flags.contains(ColIFlags::KEY))
            .collect()
    }

    pub fn next_col_id(&self) -> ColId {
        ColId(self
            .cols
            .iter()
            .map(|c| c.id.raw() + 1)
            .max()
            .unwrap_or(ColId::USER_BASE))
    }

    /// Emit the CREATE TABLE statement this definition corresponds to.
    /// Re-parsing the result reproduces the definition.
    pub fn to_create_sql(&self) -> String {
        let cols: Vec<String> = self
            .cols
            .iter()
            .map(|c| {
                let mut s = format!("{} {}", c.name, c.dtype.type_name());
                if c.flags.contains(ColIFlags::NOTNULL) {
                    s.push_str(" NOT NULL");
                }
                if c.flags.contains(ColIFlags::KEY) {
                    s.push_str(" PRIMARY KEY");
                }
                if c.flags.contains(ColIFlags::UNIQUE) {
                    s.push_str(" UNIQUE");
                }
                s
            })
            .collect();
        format!(
            "CREATE TABLE {}.{} ( {} );",
            self.schema,
            self.name,
            cols.join(", ")
        )
    }
}

/// Schema state visible to one transaction level.
#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    pub schemas: BTreeMap<String, SchemaDef>,
    pub tables: BTreeMap<(String, String), TableDef>,
}

impl SchemaSnapshot {
    pub fn table(&self, schema: &str, name: &str) -> Option<&TableDef> {
        self.tables.get(&(schema.to_owned(), name.to_owned()))
    }

    /// Highest vtable id in use, for allocating the next one.
    pub fn max_vtable(&self) -> u16 {
        self.tables
            .values()
            .map(|t| t.vtable.raw() | 1)
            .max()
            .unwrap_or(FIRST_USER_VTABLE - 1)
    }

    pub fn add_schema_row(&mut self, rec: &OwnedRecord) {
        let (Some(Some(name)), Some(Some(file))) = (rec.get(C_SCM_NAME), rec.get(C_SCM_FILE))
        else {
            return;
        };
        let name = String::from_utf8_lossy(name).into_owned();
        let file = String::from_utf8_lossy(file).into_owned();
        self.schemas.insert(name.clone(), SchemaDef { name, file });
    }

    pub fn add_table_row(&mut self, rec: &OwnedRecord) {
        let (Some(Some(scm)), Some(Some(name)), Some(Some(vtid)), Some(Some(file))) = (
            rec.get(C_TAB_SCM),
            rec.get(C_TAB_NAME),
            rec.get(C_TAB_VTID),
            rec.get(C_TAB_FILE),
        ) else {
            return;
        };
        let schema = String::from_utf8_lossy(scm).into_owned();
        let name = String::from_utf8_lossy(name).into_owned();
        let Some(vtable) = parse_hex16(vtid) else {
            return;
        };
        self.tables.insert(
            (schema.clone(), name.clone()),
            TableDef {
                schema,
                name,
                vtable: VTableId(vtable),
                file: String::from_utf8_lossy(file).into_owned(),
                cols: Vec::new(),
            },
        );
    }

    pub fn add_col_row(&mut self, schema: &str, table: &str, rec: &OwnedRecord) {
        let Some(def) = self.tables.get_mut(&(schema.to_owned(), table.to_owned())) else {
            return;
        };
        let (Some(Some(name)), Some(Some(id))) = (rec.get(C_COL_NAME), rec.get(C_COL_ID)) else {
            return;
        };
        let Some(id) = parse_hex16(id) else { return };
        let dtype = rec
            .get(C_COL_TYPE)
            .flatten()
            .and_then(|t| DataType::parse(&String::from_utf8_lossy(t)))
            .unwrap_or(DataType::Str);
        let flags = rec
            .get(C_COL_FLAGS)
            .flatten()
            .and_then(parse_hex32)
            .unwrap_or(0);
        let default = rec.get(C_COL_DEFAULT).flatten().map(|d| d.to_vec());
        def.cols.push(ColDef {
            name: String::from_utf8_lossy(name).into_owned(),
            id: ColId(id),
            dtype,
            flags: ColIFlags::from_bits_retain(flags & PERSISTED_COL_FLAGS),
            default,
        });
        def.cols.sort_by_key(|c| c.id);
    }
}

fn parse_hex16(bytes: &[u8]) -> Option<u16> {
    u16::from_str_radix(std::str::from_utf8(bytes).ok()?, 16).ok()
}

fn parse_hex32(bytes: &[u8]) -> Option<u32> {
    u32::from_str_radix(std::str::from_utf8(bytes).ok()?, 16).ok()
}

/// Record columns for a schema definition.
pub fn schema_record_cols(name: &str, file: &str) -> Vec<(ColId, Option<Vec<u8>>)> {
    vec![
        (C_SCM_NAME, Some(name.as_bytes().to_vec())),
        (C_SCM_FILE, Some(file.as_bytes().to_vec())),
    ]
}

/// Record columns for a table definition.
pub fn table_record_cols(
    schema: &str,
    name: &str,
    vtable: VTableId,
    file: &str,
) -> Vec<(ColId, Option<Vec<u8>>)> {
    vec![
        (C_TAB_SCM, Some(schema.as_bytes().to_vec())),
        (C_TAB_NAME, Some(name.as_bytes().to_vec())),
        (C_TAB_VTID, Some(format!("{:04x}", vtable.raw()).into_bytes())),
        (C_TAB_FILE, Some(file.as_bytes().to_vec())),
    ]
}

/// Record columns for a column definition.
pub fn col_record_cols(spec: &ColDefSpec, id: ColId) -> Vec<(ColId, Option<Vec<u8>>)> {
    let mut cols = vec![
        (C_COL_NAME, Some(spec.name.as_bytes().to_vec())),
        (C_COL_ID, Some(format!("{:04x}", id.raw()).into_bytes())),
        (
            C_COL_TYPE,
            Some(spec.dtype.type_name().as_bytes().to_vec()),
        ),
        (
            C_COL_FLAGS,
            Some(format!("{:08x}", spec.flags.bits() & PERSISTED_COL_FLAGS).into_bytes()),
        ),
    ];
    if let Some(default) = &spec.default {
        cols.push((C_COL_DEFAULT, Some(default.clone())));
    }
    cols
}
