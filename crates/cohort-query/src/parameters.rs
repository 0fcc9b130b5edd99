//! Query parameter collection and override resolution.
//!
//! While a compiler walks a cohort tree it discovers parameters at several
//! levels: on individual tables, on a sub-query and its filters, on a
//! composite (container) query, and process-wide globals. The same logical
//! parameter (compared by name, case-insensitively) can be declared at more
//! than one level; [`ParameterManager`] decides which declaration wins and
//! renders the final `DECLARE`/`SET` block emitted ahead of the query.
//!
//! # Precedence
//!
//! [`ParameterScope`] is ordered from the level closest to the data
//! (`TableInfo`) to the level furthest from it (`Global`). A declaration at a
//! later level overrides a same-named declaration at an earlier level, so a
//! researcher can pin `@StartDate` once at the global level and have it win
//! over every table default.
//!
//! ```rust
//! use cohort_query::{DeclaredParameter, ParameterManager, ParameterScope};
//!
//! let mut manager = ParameterManager::new();
//! manager.add(DeclaredParameter::new("DECLARE @fish AS int;", "1", "", ParameterScope::TableInfo).unwrap());
//! manager.add(DeclaredParameter::new("DECLARE @fish AS int;", "3", "", ParameterScope::Global).unwrap());
//!
//! let resolved = manager.get_final_resolved_parameters_list();
//! assert_eq!(resolved.len(), 1);
//! assert_eq!(resolved[0].value(), "3");
//! ```

use std::collections::{BTreeMap, HashMap};

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{multispace0, multispace1, one_of},
    combinator::{opt, recognize},
    sequence::{pair, preceded, tuple},
    IResult,
};
use regex::{Captures, NoExpand, Regex};

use crate::dialect::QuerySyntaxHelper;
use crate::error::{QueryError, QueryResult};

/// The level of a query tree at which a parameter was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParameterScope {
    /// Declared on a single table's metadata.
    TableInfo,
    /// Declared by one sub-query or its filters.
    QueryLevel,
    /// Declared on a container combining several sub-queries.
    CompositeQueryLevel,
    /// Process-wide, including engine constants.
    Global,
}

impl ParameterScope {
    /// Every scope, in precedence order (weakest first).
    pub const ALL: [ParameterScope; 4] = [
        ParameterScope::TableInfo,
        ParameterScope::QueryLevel,
        ParameterScope::CompositeQueryLevel,
        ParameterScope::Global,
    ];
}

/// A parameter declaration discovered while building a query.
///
/// The parameter's identity is the name parsed out of its declaration SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredParameter {
    name: String,
    declaration_sql: String,
    value: String,
    comment: String,
    scope: ParameterScope,
}

impl DeclaredParameter {
    /// Creates a parameter from its declaration statement.
    ///
    /// Fails if no parameter name can be parsed from `declaration_sql`.
    pub fn new(
        declaration_sql: impl Into<String>,
        value: impl Into<String>,
        comment: impl Into<String>,
        scope: ParameterScope,
    ) -> QueryResult<Self> {
        let declaration_sql = declaration_sql.into();
        let name = parameter_name(&declaration_sql)?;
        Ok(Self {
            name,
            declaration_sql,
            value: value.into(),
            comment: comment.into(),
            scope,
        })
    }

    /// Creates a parameter whose declaration is generated for the given
    /// dialect.
    pub fn declare(
        syntax: &QuerySyntaxHelper,
        name: &str,
        sql_type: &str,
        value: impl Into<String>,
        comment: impl Into<String>,
        scope: ParameterScope,
    ) -> Self {
        let bare = name.trim_start_matches(&['@', ':'][..]);
        Self {
            name: format!("{}{}", syntax.parameter_symbol(), bare),
            declaration_sql: syntax.get_parameter_declaration(bare, sql_type),
            value: value.into(),
            comment: comment.into(),
            scope,
        }
    }

    /// The parameter name, including its `@`/`:` prefix when declared with one.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The statement that declares the parameter.
    pub fn declaration_sql(&self) -> &str {
        &self.declaration_sql
    }

    /// The value assigned after declaration.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Free-text description emitted as a SQL comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Where the parameter was declared.
    pub fn scope(&self) -> ParameterScope {
        self.scope
    }

    /// Whether `other` is the same logical parameter.
    pub fn is_same_name(&self, other: &DeclaredParameter) -> bool {
        names_match(&self.name, &other.name)
    }

    /// Returns a copy of this parameter declared at `scope`.
    pub fn with_scope(&self, scope: ParameterScope) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    /// Returns a copy of this parameter renamed to `new_name`, with the
    /// declaration SQL rewritten to match.
    pub fn renamed(&self, new_name: &str) -> Self {
        Self {
            name: new_name.to_string(),
            declaration_sql: replace_whole_word(&self.declaration_sql, &self.name, new_name),
            ..self.clone()
        }
    }
}

/// Parses the parameter name from a `DECLARE`, `SET` or `VARIABLE`
/// statement.
///
/// ```rust
/// use cohort_query::parameter_name;
///
/// assert_eq!(parameter_name("DECLARE @StartDate AS datetime;").unwrap(), "@StartDate");
/// assert_eq!(parameter_name("set @fish=NULL;").unwrap(), "@fish");
/// assert!(parameter_name("SELECT 1").is_err());
/// ```
pub fn parameter_name(declaration_sql: &str) -> QueryResult<String> {
    match declaration_name(declaration_sql) {
        Ok((_, name)) => Ok(name.to_string()),
        Err(_) => Err(QueryError::MalformedDeclaration {
            declaration: declaration_sql.to_string(),
        }),
    }
}

fn declaration_name(input: &str) -> IResult<&str, &str> {
    preceded(
        tuple((
            multispace0,
            alt((
                tag_no_case("DECLARE"),
                tag_no_case("SET"),
                tag_no_case("VARIABLE"),
            )),
            multispace1,
        )),
        recognize(pair(
            opt(one_of("@:")),
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '#' || c == '$'),
        )),
    )(input)
}

fn names_match(a: &str, b: &str) -> bool {
    a.trim_start_matches(&['@', ':'][..])
        .eq_ignore_ascii_case(b.trim_start_matches(&['@', ':'][..]))
}

/// Replaces whole-word, case-insensitive occurrences of a parameter name.
fn replace_whole_word(sql: &str, name: &str, replacement: &str) -> String {
    match whole_word_pattern([name]) {
        Some(pattern) => pattern.replace_all(sql, NoExpand(replacement)).into_owned(),
        None => sql.to_string(),
    }
}

/// Applies every `(old, new)` rename in a single pass, so text produced by
/// one rename is never matched by another.
fn replace_names(sql: &str, renames: &[(String, String)]) -> String {
    let Some(pattern) = whole_word_pattern(renames.iter().map(|(old, _)| old.as_str())) else {
        return sql.to_string();
    };
    let lookup: HashMap<String, &str> = renames
        .iter()
        .map(|(old, new)| (old.to_lowercase(), new.as_str()))
        .collect();

    pattern
        .replace_all(sql, |caps: &Captures<'_>| {
            let found = &caps[0];
            lookup
                .get(&found.to_lowercase())
                .map_or_else(|| found.to_string(), |new| (*new).to_string())
        })
        .into_owned()
}

fn appears_in(sql: &str, name: &str) -> bool {
    whole_word_pattern([name]).is_some_and(|pattern| pattern.is_match(sql))
}

/// Case-insensitive alternation of `names`, each ending on a word boundary.
/// Longer names are tried first so `@code_2` is never read as `@code`.
fn whole_word_pattern<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Regex> {
    let mut names: Vec<&str> = names.into_iter().collect();
    if names.is_empty() {
        return None;
    }
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));
    let alternation = names.iter().map(|name| regex::escape(name)).collect::<Vec<_>>().join("|");
    Regex::new(&format!(r"(?i)(?:{alternation})\b")).ok()
}

/// Collects parameters by scope and resolves name collisions.
#[derive(Debug, Clone, Default)]
pub struct ParameterManager {
    parameters: BTreeMap<ParameterScope, Vec<DeclaredParameter>>,
}

impl ParameterManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a parameter at its own scope.
    ///
    /// A second declaration of the same name at the same scope is ignored and
    /// `false` is returned.
    pub fn add(&mut self, parameter: DeclaredParameter) -> bool {
        let bucket = self.parameters.entry(parameter.scope()).or_default();
        if bucket.iter().any(|existing| existing.is_same_name(&parameter)) {
            return false;
        }
        bucket.push(parameter);
        true
    }

    /// Records several parameters.
    pub fn add_all(&mut self, parameters: impl IntoIterator<Item = DeclaredParameter>) {
        for parameter in parameters {
            self.add(parameter);
        }
    }

    /// Parameters declared at `scope`, in discovery order.
    pub fn parameters_at(&self, scope: ParameterScope) -> &[DeclaredParameter] {
        self.parameters.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every parameter, weakest scope first.
    pub fn iter(&self) -> impl Iterator<Item = &DeclaredParameter> {
        self.parameters.values().flatten()
    }

    /// Total number of parameters recorded.
    pub fn len(&self) -> usize {
        self.parameters.values().map(Vec::len).sum()
    }

    /// Whether no parameters have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the declaration that overrides `parameter`, if any.
    ///
    /// Only declarations at a later scope override; of those, the one at the
    /// latest scope is returned. Returns `None` when `parameter` is itself the
    /// winning declaration for its name.
    pub fn get_override_if_any_for(&self, parameter: &DeclaredParameter) -> Option<&DeclaredParameter> {
        self.parameters
            .range(parameter.scope()..)
            .rev()
            .filter(|(scope, _)| **scope > parameter.scope())
            .flat_map(|(_, bucket)| bucket.iter())
            .find(|candidate| candidate.is_same_name(parameter))
    }

    /// Every parameter superseded by a same-named declaration at a later
    /// scope, weakest scope first.
    pub fn get_overriden_parameters(&self) -> Vec<&DeclaredParameter> {
        self.iter()
            .filter(|p| self.get_override_if_any_for(p).is_some())
            .collect()
    }

    /// Exactly one declaration per distinct name: the winning one.
    pub fn get_final_resolved_parameters_list(&self) -> Vec<&DeclaredParameter> {
        self.iter()
            .filter(|p| self.get_override_if_any_for(p).is_none())
            .collect()
    }

    /// Renders the declaration block emitted ahead of a compiled query.
    ///
    /// Each resolved parameter produces
    /// `/*<comment>*/\n<declaration>\nSET <name>=<value>;\n`. Dialects without
    /// embedded parameter support get an empty block.
    pub fn declaration_block(&self, syntax: &QuerySyntaxHelper) -> String {
        if !syntax.supports_embedded_parameters() {
            return String::new();
        }

        self.get_final_resolved_parameters_list()
            .into_iter()
            .map(|p| {
                format!(
                    "/*{}*/\n{}\nSET {}={};\n",
                    p.comment(),
                    p.declaration_sql(),
                    p.name(),
                    p.value()
                )
            })
            .collect()
    }

    /// Lifts the resolved parameters of an independently built sub-query into
    /// this manager at [`ParameterScope::CompositeQueryLevel`].
    ///
    /// When an incoming parameter collides by name with one already held but
    /// carries a different value, it is renamed (`@name_2`, `@name_3`, ...)
    /// and the sub-query's SQL is rewritten to use the new name. New names
    /// never clash with a name held here, a name the sub-query brings along
    /// or a name already written in `sql`. Returns the (possibly rewritten)
    /// SQL.
    pub fn import_and_elevate(&mut self, sub_query: &ParameterManager, sql: &str) -> String {
        let incoming = sub_query.get_final_resolved_parameters_list();
        let mut taken: Vec<String> = incoming.iter().map(|p| p.name().to_string()).collect();
        let mut renames: Vec<(String, String)> = Vec::new();

        for parameter in incoming {
            let existing = self.iter().find(|p| p.is_same_name(parameter)).cloned();

            match existing {
                None => {
                    self.add(parameter.with_scope(ParameterScope::CompositeQueryLevel));
                }
                Some(existing)
                    if existing.value() == parameter.value()
                        && existing
                            .declaration_sql()
                            .eq_ignore_ascii_case(parameter.declaration_sql()) => {}
                Some(_) => {
                    let new_name = self.next_free_name(parameter.name(), &taken, sql);
                    taken.push(new_name.clone());
                    renames.push((parameter.name().to_string(), new_name.clone()));
                    self.add(
                        parameter
                            .renamed(&new_name)
                            .with_scope(ParameterScope::CompositeQueryLevel),
                    );
                }
            }
        }

        replace_names(sql, &renames)
    }

    fn next_free_name(&self, name: &str, taken: &[String], sql: &str) -> String {
        (2..)
            .map(|suffix| format!("{name}_{suffix}"))
            .find(|candidate| {
                !self.iter().any(|p| names_match(p.name(), candidate))
                    && !taken.iter().any(|t| names_match(t, candidate))
                    && !appears_in(sql, candidate)
            })
            .unwrap_or_else(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabaseType;

    fn param(name: &str, value: &str, scope: ParameterScope) -> DeclaredParameter {
        DeclaredParameter::new(format!("DECLARE {name} AS int;"), value, "", scope).unwrap()
    }

    #[test]
    fn test_parameter_name_forms() {
        assert_eq!(parameter_name("DECLARE @fish AS varchar(10);").unwrap(), "@fish");
        assert_eq!(parameter_name("  declare\n@Fish as int").unwrap(), "@Fish");
        assert_eq!(parameter_name("SET @x_1=NULL;").unwrap(), "@x_1");
        assert_eq!(parameter_name("VARIABLE fish NUMBER;").unwrap(), "fish");
    }

    #[test]
    fn test_parameter_name_rejects_non_declarations() {
        let err = parameter_name("SELECT * FROM fish").unwrap_err();
        assert!(matches!(err, QueryError::MalformedDeclaration { .. }));
        assert!(parameter_name("DECLARE").is_err());
        assert!(parameter_name("").is_err());
    }

    #[test]
    fn test_global_overrides_table_info() {
        let mut manager = ParameterManager::new();
        let table = param("@fish", "1", ParameterScope::TableInfo);
        let global = param("@fish", "3", ParameterScope::Global);
        manager.add(table.clone());
        manager.add(global.clone());

        let resolved = manager.get_final_resolved_parameters_list();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].value(), "3");

        assert_eq!(manager.get_override_if_any_for(&table), Some(&global));
        assert_eq!(manager.get_override_if_any_for(&global), None);
    }

    #[test]
    fn test_names_compare_case_insensitively() {
        let mut manager = ParameterManager::new();
        manager.add(param("@Fish", "1", ParameterScope::TableInfo));
        manager.add(param("@fish", "3", ParameterScope::QueryLevel));

        let resolved = manager.get_final_resolved_parameters_list();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name(), "@fish");
        assert_eq!(resolved[0].value(), "3");
    }

    #[test]
    fn test_override_picks_latest_scope() {
        let mut manager = ParameterManager::new();
        let table = param("@d", "1", ParameterScope::TableInfo);
        manager.add(table.clone());
        manager.add(param("@d", "2", ParameterScope::QueryLevel));
        manager.add(param("@d", "4", ParameterScope::Global));
        manager.add(param("@d", "3", ParameterScope::CompositeQueryLevel));

        assert_eq!(manager.get_override_if_any_for(&table).unwrap().value(), "4");

        let overridden: Vec<&str> = manager
            .get_overriden_parameters()
            .iter()
            .map(|p| p.value())
            .collect();
        assert_eq!(overridden, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_overridden_never_contains_winner() {
        let mut manager = ParameterManager::new();
        manager.add(param("@a", "1", ParameterScope::TableInfo));
        manager.add(param("@a", "2", ParameterScope::CompositeQueryLevel));
        manager.add(param("@b", "1", ParameterScope::QueryLevel));

        let overridden = manager.get_overriden_parameters();
        assert_eq!(overridden.len(), 1);
        assert_eq!(overridden[0].scope(), ParameterScope::TableInfo);

        let resolved = manager.get_final_resolved_parameters_list();
        assert_eq!(resolved.len(), 2);
        for winner in resolved {
            assert!(!manager.get_overriden_parameters().contains(&winner));
        }
    }

    #[test]
    fn test_duplicate_at_same_scope_keeps_first() {
        let mut manager = ParameterManager::new();
        assert!(manager.add(param("@a", "1", ParameterScope::QueryLevel)));
        assert!(!manager.add(param("@A", "2", ParameterScope::QueryLevel)));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.parameters_at(ParameterScope::QueryLevel)[0].value(), "1");
    }

    #[test]
    fn test_declaration_block_format() {
        let mut manager = ParameterManager::new();
        manager.add(
            DeclaredParameter::new("DECLARE @fish AS int;", "3", "number of fish", ParameterScope::Global)
                .unwrap(),
        );

        let block = manager.declaration_block(&DatabaseType::MicrosoftSqlServer.syntax());
        assert_eq!(block, "/*number of fish*/\nDECLARE @fish AS int;\nSET @fish=3;\n");
    }

    #[test]
    fn test_declaration_block_suppressed_without_parameter_support() {
        let mut manager = ParameterManager::new();
        manager.add(param("@fish", "3", ParameterScope::Global));
        assert_eq!(manager.declaration_block(&DatabaseType::Oracle.syntax()), "");
    }

    #[test]
    fn test_declare_uses_dialect() {
        let p = DeclaredParameter::declare(
            &DatabaseType::MySql.syntax(),
            "ProjectNumber",
            "int",
            "7",
            "",
            ParameterScope::Global,
        );
        assert_eq!(p.name(), "@ProjectNumber");
        assert_eq!(p.declaration_sql(), "SET @ProjectNumber=NULL;");
        assert_eq!(parameter_name(p.declaration_sql()).unwrap(), p.name());
    }

    #[test]
    fn test_import_renames_conflicting_values() {
        let mut composite = ParameterManager::new();
        let mut first = ParameterManager::new();
        first.add(param("@code", "'E11'", ParameterScope::QueryLevel));
        let mut second = ParameterManager::new();
        second.add(param("@code", "'E10'", ParameterScope::QueryLevel));

        let sql1 = composite.import_and_elevate(&first, "SELECT chi FROM t WHERE code=@code");
        let sql2 = composite.import_and_elevate(&second, "SELECT chi FROM t WHERE code=@code");

        assert_eq!(sql1, "SELECT chi FROM t WHERE code=@code");
        assert_eq!(sql2, "SELECT chi FROM t WHERE code=@code_2");

        let names: Vec<&str> = composite
            .parameters_at(ParameterScope::CompositeQueryLevel)
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["@code", "@code_2"]);
        assert_eq!(
            composite.parameters_at(ParameterScope::CompositeQueryLevel)[1].declaration_sql(),
            "DECLARE @code_2 AS int;"
        );
    }

    #[test]
    fn test_import_merges_identical_parameters() {
        let mut composite = ParameterManager::new();
        let mut sub = ParameterManager::new();
        sub.add(param("@code", "'E11'", ParameterScope::QueryLevel));

        composite.import_and_elevate(&sub, "x");
        let sql = composite.import_and_elevate(&sub, "WHERE code=@code");

        assert_eq!(sql, "WHERE code=@code");
        assert_eq!(composite.len(), 1);
    }

    #[test]
    fn test_rename_only_touches_whole_words() {
        let sql = replace_whole_word("@code=1 AND @code_type=2 AND @CODE=3", "@code", "@code_2");
        assert_eq!(sql, "@code_2=1 AND @code_type=2 AND @code_2=3");
    }

    #[test]
    fn test_renames_apply_in_one_pass() {
        let renames = vec![
            ("@code".to_string(), "@code_2".to_string()),
            ("@code_2".to_string(), "@code_3".to_string()),
        ];
        let sql = replace_names("@code=1 AND @CODE_2=2 AND @code_type=3", &renames);
        assert_eq!(sql, "@code_2=1 AND @code_3=2 AND @code_type=3");
    }

    #[test]
    fn test_import_avoids_names_the_sub_query_brings() {
        let mut composite = ParameterManager::new();
        let mut first = ParameterManager::new();
        first.add(param("@code", "'X'", ParameterScope::QueryLevel));
        composite.import_and_elevate(&first, "WHERE code=@code");

        // an already-combined sub-query carrying @code and @code_2
        let mut nested = ParameterManager::new();
        nested.add(param("@code", "'Y'", ParameterScope::CompositeQueryLevel));
        nested.add(param("@code_2", "'Z'", ParameterScope::CompositeQueryLevel));
        let sql = composite.import_and_elevate(&nested, "WHERE code=@code\nUNION\nWHERE code=@code_2");

        assert_eq!(sql, "WHERE code=@code_3\nUNION\nWHERE code=@code_2");
        let values: Vec<(&str, &str)> = composite
            .get_final_resolved_parameters_list()
            .iter()
            .map(|p| (p.name(), p.value()))
            .collect();
        assert_eq!(values, vec![("@code", "'X'"), ("@code_3", "'Y'"), ("@code_2", "'Z'")]);
    }

    #[test]
    fn test_import_avoids_names_written_in_sql() {
        let mut composite = ParameterManager::new();
        let mut first = ParameterManager::new();
        first.add(param("@code", "'X'", ParameterScope::QueryLevel));
        composite.import_and_elevate(&first, "x");

        let mut second = ParameterManager::new();
        second.add(param("@code", "'Y'", ParameterScope::QueryLevel));
        let sql = composite.import_and_elevate(&second, "WHERE code=@code AND n=@code_2");

        assert_eq!(sql, "WHERE code=@code_3 AND n=@code_2");
    }
}
