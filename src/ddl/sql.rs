//! The DDL-planner boundary, expressed over sqlparser ASTs.
//!
//! The host's planner hands resolved structures to `MetadataModifier`; this
//! adapter produces them from parsed SQL so the subsystem can be driven end
//! to end: CREATE/ALTER/DROP/RENAME TABLE for column metadata,
//! CREATE/DROP EXTENSION for install/uninstall, and qualified function
//! references in queries for the statement's `to_call` list.

use sqlparser::ast::{
    AlterTableOperation, ColumnDef, DataType, Expr, ObjectName, ObjectNamePart, ObjectType,
    SelectItem, SetExpr, Statement,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::ddl::{
    resolve_type, AlterColumnChange, AlterSpec, CreateFieldInfo, CustomTypeRef, MetadataModifier,
};
use crate::error::{Error, Result};
use crate::runtime::ExtensionRuntime;
use crate::session::{Arena, Session};

fn object_name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.clone()),
            _ => None,
        })
        .collect()
}

fn db_and_table(name: &ObjectName, session: &Session) -> (String, String) {
    let parts = object_name_parts(name);
    match parts.len() {
        0 => (session.current_db().to_string(), String::new()),
        1 => (session.current_db().to_string(), parts[0].clone()),
        _ => (parts[0].clone(), parts[1].clone()),
    }
}

/// Resolve a column's declared type. Custom types come back as a
/// `CustomTypeRef`; unknown custom type names are an error, built-in types
/// are `None`.
fn resolve_column_type(
    runtime: &ExtensionRuntime,
    data_type: &DataType,
    arena: &Arena,
) -> Result<Option<CustomTypeRef>> {
    let DataType::Custom(name, _args) = data_type else {
        return Ok(None);
    };
    let parts = object_name_parts(name);
    let (extension, type_name) = match parts.len() {
        1 => (None, parts[0].as_str()),
        2 => (Some(parts[0].as_str()), parts[1].as_str()),
        _ => {
            return Err(Error::Parse(format!(
                "Invalid type name '{}'",
                parts.join(".")
            )))
        }
    };
    match resolve_type(&runtime.victionary, extension, type_name, arena)? {
        Some(context) => Ok(Some(CustomTypeRef::from_context(context))),
        None => Err(Error::Validation(format!(
            "Unknown data type '{}'",
            type_name
        ))),
    }
}

fn create_field(
    runtime: &ExtensionRuntime,
    column: &ColumnDef,
    arena: &Arena,
) -> Result<CreateFieldInfo> {
    Ok(CreateFieldInfo {
        name: column.name.value.clone(),
        custom: resolve_column_type(runtime, &column.data_type, arena)?,
    })
}

/// Collect `extension.function` references from an expression tree.
fn collect_function_refs(expr: &Expr, out: &mut Vec<(String, String)>) {
    match expr {
        Expr::Function(func) => {
            let parts = object_name_parts(&func.name);
            if parts.len() == 2 {
                out.push((parts[0].clone(), parts[1].clone()));
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_function_refs(left, out);
            collect_function_refs(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => {
            collect_function_refs(expr, out);
        }
        _ => {}
    }
}

/// Drive the subsystem from one SQL statement. Statements without custom
/// metadata implications are a no-op.
pub fn process_statement(
    runtime: &ExtensionRuntime,
    session: &Session,
    statement: &Statement,
) -> Result<()> {
    let arena = Arena::new();
    match statement {
        Statement::CreateTable(create) => {
            let (db, table) = db_and_table(&create.name, session);
            let mut fields = Vec::with_capacity(create.columns.len());
            for column in &create.columns {
                fields.push(create_field(runtime, column, &arena)?);
            }
            MetadataModifier::process_create(runtime, session, &db, &table, &fields, None)
        }
        Statement::AlterTable {
            name, operations, ..
        } => {
            let (db, table) = db_and_table(name, session);
            let mut spec = AlterSpec::default();
            for op in operations {
                match op {
                    AlterTableOperation::RenameTable { table_name, .. } => {
                        let (new_db, new_table) = db_and_table(table_name, session);
                        spec.rename_to = Some((new_db, new_table));
                    }
                    AlterTableOperation::DropColumn { column_name, .. } => {
                        spec.dropped_columns.push(column_name.value.clone());
                    }
                    AlterTableOperation::RenameColumn {
                        old_column_name,
                        new_column_name,
                        ..
                    } => {
                        spec.renamed_columns.push((
                            old_column_name.value.clone(),
                            new_column_name.value.clone(),
                        ));
                    }
                    AlterTableOperation::AddColumn { column_def, .. } => {
                        spec.changes.push(AlterColumnChange {
                            old_name: None,
                            new_name: column_def.name.value.clone(),
                            custom: resolve_column_type(runtime, &column_def.data_type, &arena)?,
                        });
                    }
                    AlterTableOperation::ModifyColumn {
                        col_name,
                        data_type,
                        ..
                    } => {
                        spec.changes.push(AlterColumnChange {
                            old_name: Some(col_name.value.clone()),
                            new_name: col_name.value.clone(),
                            custom: resolve_column_type(runtime, data_type, &arena)?,
                        });
                    }
                    AlterTableOperation::ChangeColumn {
                        old_name,
                        new_name,
                        data_type,
                        ..
                    } => {
                        spec.changes.push(AlterColumnChange {
                            old_name: Some(old_name.value.clone()),
                            new_name: new_name.value.clone(),
                            custom: resolve_column_type(runtime, data_type, &arena)?,
                        });
                    }
                    _ => {}
                }
            }
            MetadataModifier::process_alter(runtime, session, &db, &table, &spec, None)
        }
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            temporary,
            ..
        } => {
            let tables: Vec<(String, String)> =
                names.iter().map(|n| db_and_table(n, session)).collect();
            MetadataModifier::process_drop(runtime, session, *temporary, &tables)
        }
        Statement::RenameTable(renames) => {
            let pairs: Vec<((String, String), (String, String))> = renames
                .iter()
                .map(|r| {
                    (
                        db_and_table(&r.old_name, session),
                        db_and_table(&r.new_name, session),
                    )
                })
                .collect();
            MetadataModifier::process_rename(runtime, session, &pairs)
        }
        Statement::CreateExtension { name, .. } => {
            runtime.install_extension(session, &name.value)
        }
        Statement::DropExtension { names, .. } => {
            for name in names {
                runtime.uninstall_extension(session, &name.value)?;
            }
            Ok(())
        }
        Statement::Query(query) => {
            let mut refs = Vec::new();
            if let SetExpr::Select(select) = query.body.as_ref() {
                for item in &select.projection {
                    match item {
                        SelectItem::UnnamedExpr(expr)
                        | SelectItem::ExprWithAlias { expr, .. } => {
                            collect_function_refs(expr, &mut refs);
                        }
                        _ => {}
                    }
                }
                if let Some(selection) = &select.selection {
                    collect_function_refs(selection, &mut refs);
                }
            }
            if refs.is_empty() {
                return Ok(());
            }
            MetadataModifier::process_calls(runtime, session, &refs)
        }
        _ => Ok(()),
    }
}

/// Parse and process a SQL string (possibly several statements).
pub fn process_sql(runtime: &ExtensionRuntime, session: &Session, sql: &str) -> Result<()> {
    let dialect = GenericDialect {};
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| Error::Parse(e.to_string()))?;
    for statement in &statements {
        process_statement(runtime, session, statement)?;
    }
    Ok(())
}
