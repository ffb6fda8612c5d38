//! Column-set algebra used to decide which columns each table contributes.
//!
//! The case table is a wide template: background tables only contribute the
//! columns it also names, and it keeps for itself only the columns no background
//! table provides. All results are sorted so the projections are stable between runs.

use std::collections::BTreeSet;

/// Sorted intersection of the case table's columns with another table's columns.
pub fn relevant_columns(case_columns: &[String], other_columns: &[String]) -> Vec<String> {
    let other: BTreeSet<&str> = other_columns.iter().map(String::as_str).collect();
    case_columns
        .iter()
        .map(String::as_str)
        .filter(|name| other.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// The key column followed by the sorted case columns found in no other table.
pub fn case_only_columns(case_columns: &[String], others: &[&[String]], key: &str) -> Vec<String> {
    let elsewhere: BTreeSet<&str> = others
        .iter()
        .flat_map(|cols| cols.iter().map(String::as_str))
        .collect();
    let only_here: BTreeSet<&str> = case_columns
        .iter()
        .map(String::as_str)
        .filter(|name| *name != key && !elsewhere.contains(name))
        .collect();

    std::iter::once(key)
        .chain(only_here)
        .map(str::to_string)
        .collect()
}

/// Columns read from a background table: the ones shared with the case table plus
/// `required` columns the table has even when the case table lacks them.
pub fn aux_projection(
    case_columns: &[String],
    aux_columns: &[String],
    required: &[&str],
) -> Vec<String> {
    let mut projection: BTreeSet<String> = relevant_columns(case_columns, aux_columns)
        .into_iter()
        .collect();
    for name in required {
        if aux_columns.iter().any(|c| c == name) {
            projection.insert((*name).to_string());
        }
    }
    projection.into_iter().collect()
}

/// Equality join keys between the running table and a background table.
pub fn shared_keys(left: &[String], right: &[String]) -> Vec<String> {
    relevant_columns(left, right)
}
