//! SQL dialect helpers for the three supported backends.
//!
//! Every component that emits SQL text goes through a [`QuerySyntaxHelper`]
//! so that identifiers are quoted and qualified the way the target backend
//! expects, and so that dialect-specific quirks (parameter support, set
//! operation keywords, hashing functions) live in one place.

use crate::configuration::SetOperation;

/// The kind of relational backend a server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DatabaseType {
    /// Microsoft SQL Server.
    MicrosoftSqlServer,
    /// MySQL / MariaDB.
    MySql,
    /// Oracle. Has no embedded parameter syntax.
    Oracle,
}

impl DatabaseType {
    /// Returns the syntax helper for this backend.
    pub fn syntax(self) -> QuerySyntaxHelper {
        QuerySyntaxHelper::new(self)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::MicrosoftSqlServer => write!(f, "MicrosoftSQLServer"),
            DatabaseType::MySql => write!(f, "MySql"),
            DatabaseType::Oracle => write!(f, "Oracle"),
        }
    }
}

/// Produces identifiers, parameter declarations and other dialect-specific
/// SQL fragments for one [`DatabaseType`].
///
/// # Example
///
/// ```rust
/// use cohort_query::DatabaseType;
///
/// let sql_server = DatabaseType::MicrosoftSqlServer.syntax();
/// assert_eq!(
///     sql_server.ensure_fully_qualified("Cohorts", "Cohort"),
///     "[Cohorts]..[Cohort]"
/// );
///
/// let mysql = DatabaseType::MySql.syntax();
/// assert_eq!(mysql.ensure_fully_qualified("cohorts", "cohort"), "`cohorts`.`cohort`");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySyntaxHelper {
    database_type: DatabaseType,
}

impl QuerySyntaxHelper {
    /// Creates a helper for the given backend.
    pub fn new(database_type: DatabaseType) -> Self {
        Self { database_type }
    }

    /// The backend this helper targets.
    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn quote_chars(&self) -> (char, char) {
        match self.database_type {
            DatabaseType::MicrosoftSqlServer => ('[', ']'),
            DatabaseType::MySql => ('`', '`'),
            DatabaseType::Oracle => ('"', '"'),
        }
    }

    /// Returns the bare runtime name of a (possibly qualified, possibly
    /// aliased, possibly quoted) identifier.
    ///
    /// `[db]..[tbl].[chi]` and `` `db`.`tbl`.`chi` `` both yield `chi`;
    /// `UPPER(x) AS chi` yields `chi`.
    pub fn get_runtime_name(&self, name: &str) -> String {
        let name = name.trim();
        let name = match find_alias(name) {
            Some(alias) => alias,
            None => name,
        };

        let last = split_qualified(name).pop().unwrap_or_default();
        strip_quotes(last.trim()).to_string()
    }

    /// Wraps a bare identifier in the dialect's quote characters.
    pub fn ensure_wrapped(&self, name: &str) -> String {
        let runtime = self.get_runtime_name(name);
        let (open, close) = self.quote_chars();
        let escaped = runtime.replace(close, &format!("{close}{close}"));
        match self.database_type {
            DatabaseType::Oracle => format!("{open}{}{close}", escaped.to_uppercase()),
            _ => format!("{open}{escaped}{close}"),
        }
    }

    /// Returns the fully qualified name of a table.
    pub fn ensure_fully_qualified(&self, database: &str, table: &str) -> String {
        let database = self.ensure_wrapped(database);
        let table = self.ensure_wrapped(table);
        match self.database_type {
            // default schema
            DatabaseType::MicrosoftSqlServer => format!("{database}..{table}"),
            DatabaseType::MySql | DatabaseType::Oracle => format!("{database}.{table}"),
        }
    }

    /// Returns the fully qualified name of a column.
    pub fn ensure_fully_qualified_column(&self, database: &str, table: &str, column: &str) -> String {
        format!(
            "{}.{}",
            self.ensure_fully_qualified(database, table),
            self.ensure_wrapped(column)
        )
    }

    /// Whether the backend supports declaring parameters inline ahead of a
    /// query. When it does not, parameter declarations are never emitted.
    pub fn supports_embedded_parameters(&self) -> bool {
        !matches!(self.database_type, DatabaseType::Oracle)
    }

    /// The prefix character of a parameter name.
    pub fn parameter_symbol(&self) -> char {
        match self.database_type {
            DatabaseType::Oracle => ':',
            _ => '@',
        }
    }

    /// Returns the statement that declares `name` with the given SQL type.
    ///
    /// `name` may be given with or without the parameter symbol.
    pub fn get_parameter_declaration(&self, name: &str, sql_type: &str) -> String {
        let symbol = self.parameter_symbol();
        let bare = name.trim_start_matches(&['@', ':'][..]);
        match self.database_type {
            DatabaseType::MicrosoftSqlServer => format!("DECLARE {symbol}{bare} AS {sql_type};"),
            // user variables are untyped
            DatabaseType::MySql => format!("SET {symbol}{bare}=NULL;"),
            DatabaseType::Oracle => format!("VARIABLE {bare} {sql_type};"),
        }
    }

    /// The keyword that combines sibling sub-queries.
    pub fn set_operation_keyword(&self, operation: SetOperation) -> &'static str {
        match (self.database_type, operation) {
            (_, SetOperation::Union) => "UNION",
            (_, SetOperation::Intersect) => "INTERSECT",
            (DatabaseType::Oracle, SetOperation::Except) => "MINUS",
            (_, SetOperation::Except) => "EXCEPT",
        }
    }

    /// Quotes a string literal.
    pub fn escape_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Wraps `expression` in the dialect's salted SHA-256 hashing function.
    pub fn hash_expression(&self, expression: &str, salt: &str) -> String {
        let salt = self.escape_literal(salt);
        match self.database_type {
            DatabaseType::MicrosoftSqlServer => format!(
                "CONVERT(varchar(64), HASHBYTES('SHA2_256', CONCAT({expression}, {salt})), 2)"
            ),
            DatabaseType::MySql => format!("SHA2(CONCAT({expression}, {salt}), 256)"),
            DatabaseType::Oracle => {
                format!("RAWTOHEX(STANDARD_HASH({expression} || {salt}, 'SHA256'))")
            }
        }
    }
}

/// Returns the alias of `x AS alias`, if the expression has one at the top
/// level.
fn find_alias(name: &str) -> Option<&str> {
    let upper = name.to_ascii_uppercase();
    let mut depth = 0usize;
    let mut found = None;
    for (i, ch) in upper.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && upper[i..].starts_with(" AS ") => found = Some(i + 4),
            _ => {}
        }
    }
    found.map(|start| name[start..].trim())
}

/// Splits `a.b..c` on dots that are not inside quote characters, dropping
/// empty segments.
fn split_qualified(name: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in name.char_indices() {
        match (in_quote, ch) {
            (None, '[') => in_quote = Some(']'),
            (None, '`') | (None, '"') => in_quote = Some(ch),
            (Some(close), c) if c == close => in_quote = None,
            (None, '.') => {
                if i > start {
                    parts.push(&name[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < name.len() {
        parts.push(&name[start..]);
    }
    parts
}

fn strip_quotes(name: &str) -> &str {
    for (open, close) in [('[', ']'), ('`', '`'), ('"', '"')] {
        if name.len() >= 2 && name.starts_with(open) && name.ends_with(close) {
            return &name[1..name.len() - 1];
        }
    }
    name
}
