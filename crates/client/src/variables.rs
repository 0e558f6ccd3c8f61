//! Turning variable lookup failures into answers.
//!
//! When a path cannot be fully resolved, 3.1.0+ devices say which segment was
//! missing or held `invalid`. Depending on where that segment sits in the
//! path, the lookup either resolves to a synthesized variable or fails with a
//! message in the language's own wording.

use protocol::{ErrorData, Variable, VariableType, VariableValue};

use crate::error::ClientError;

/// Value given to a missing key read from an associative array.
pub const NOT_DEFINED_VALUE: &str = "Invalid (not defined)";
/// Value given to a segment that resolved to `invalid`.
pub const INVALID_VALUE: &str = "Invalid";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Synthesis {
    Variable(Variable),
    Failed(String),
    /// The answer depends on the type of `path[..index]`, which has to be
    /// looked up on the device.
    NeedsParentType { index: usize },
}

/// Decide what an error response to a lookup of `path` means.
///
/// Returns `Ok(None)` when the response carries no path detail and should be
/// returned to the caller as is.
pub(crate) fn synthesize(
    path: &[String],
    error_data: Option<&ErrorData>,
) -> Result<Option<Synthesis>, ClientError> {
    let Some(data) = error_data else {
        return Ok(None);
    };
    match (data.missing_key_index, data.invalid_path_index) {
        (Some(_), Some(_)) => Err(ClientError::AmbiguousVariableError),
        (Some(index), None) => Ok(index_in(path, index).map(|i| missing_key(path, i))),
        (None, Some(index)) => Ok(index_in(path, index).map(|i| invalid_value(path, i))),
        (None, None) => Ok(None),
    }
}

fn index_in(path: &[String], index: i32) -> Option<usize> {
    usize::try_from(index).ok().filter(|i| *i < path.len())
}

fn missing_key(path: &[String], index: usize) -> Synthesis {
    if path.len() == 1 {
        return Synthesis::Variable(Variable::new(&path[0], VariableType::Uninitialized));
    }
    if index == 0 {
        return Synthesis::Failed(cannot_read(&path[1], VariableType::Uninitialized.as_str()));
    }
    Synthesis::NeedsParentType { index }
}

fn invalid_value(path: &[String], index: usize) -> Synthesis {
    if index + 1 == path.len() {
        let name = &path[index];
        return Synthesis::Variable(
            Variable::new(name, VariableType::Invalid)
                .with_value(VariableValue::String(INVALID_VALUE.to_string())),
        );
    }
    Synthesis::Failed(cannot_read(&path[index + 1], VariableType::Invalid.as_str()))
}

/// Finish a [`Synthesis::NeedsParentType`] once the parent's type is known.
///
/// `parent_type` is `None` when the parent could not be looked up either.
pub(crate) fn with_parent_type(
    path: &[String],
    index: usize,
    parent_type: Option<VariableType>,
) -> Synthesis {
    let segment = &path[index];
    let is_last = index + 1 == path.len();
    match parent_type {
        Some(VariableType::AssociativeArray | VariableType::SubtypedObject) if is_last => {
            Synthesis::Variable(
                Variable::new(segment, VariableType::Invalid)
                    .with_value(VariableValue::String(NOT_DEFINED_VALUE.to_string())),
            )
        }
        Some(parent) => Synthesis::Failed(cannot_read(segment, parent.as_str())),
        None => Synthesis::Failed(cannot_read(segment, VariableType::Unknown.as_str())),
    }
}

fn cannot_read(segment: &str, type_name: &str) -> String {
    format!("cannot read '{segment}' on type '{type_name}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn missing(index: i32) -> ErrorData {
        ErrorData {
            missing_key_index: Some(index),
            invalid_path_index: None,
        }
    }

    fn invalid(index: i32) -> ErrorData {
        ErrorData {
            missing_key_index: None,
            invalid_path_index: Some(index),
        }
    }

    #[test]
    fn no_detail_passes_through() {
        assert_eq!(synthesize(&path(&["a"]), None).unwrap(), None);
        assert_eq!(
            synthesize(&path(&["a"]), Some(&ErrorData::default())).unwrap(),
            None
        );
    }

    #[test]
    fn single_missing_segment_is_uninitialized() {
        let result = synthesize(&path(&["m"]), Some(&missing(0))).unwrap().unwrap();
        assert_eq!(
            result,
            Synthesis::Variable(Variable::new("m", VariableType::Uninitialized))
        );
    }

    #[test]
    fn single_invalid_segment_is_invalid() {
        let result = synthesize(&path(&["m"]), Some(&invalid(0))).unwrap().unwrap();
        let Synthesis::Variable(var) = result else {
            panic!("expected a variable");
        };
        assert_eq!(var.variable_type, VariableType::Invalid);
        assert_eq!(var.name.as_deref(), Some("m"));
    }

    #[test]
    fn leftmost_missing_reads_on_uninitialized() {
        let result = synthesize(&path(&["m", "top"]), Some(&missing(0)))
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            Synthesis::Failed("cannot read 'top' on type 'Uninitialized'".into())
        );
    }

    #[test]
    fn interior_invalid_reads_on_invalid() {
        let result = synthesize(&path(&["m", "top", "x"]), Some(&invalid(1)))
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            Synthesis::Failed("cannot read 'x' on type 'Invalid'".into())
        );
    }

    #[test]
    fn last_invalid_is_synthesized() {
        let result = synthesize(&path(&["m", "top"]), Some(&invalid(1)))
            .unwrap()
            .unwrap();
        assert!(matches!(result, Synthesis::Variable(v) if v.variable_type == VariableType::Invalid));
    }

    #[test]
    fn missing_last_key_on_associative_array_is_not_defined() {
        let p = path(&["m", "top", "missingProp"]);
        let result = synthesize(&p, Some(&missing(2))).unwrap().unwrap();
        assert_eq!(result, Synthesis::NeedsParentType { index: 2 });

        let result = with_parent_type(&p, 2, Some(VariableType::AssociativeArray));
        assert_eq!(
            result,
            Synthesis::Variable(
                Variable::new("missingProp", VariableType::Invalid)
                    .with_value(VariableValue::String("Invalid (not defined)".into()))
            )
        );
    }

    #[test]
    fn missing_key_on_other_parent_fails() {
        let p = path(&["m", "count", "x"]);
        assert_eq!(
            with_parent_type(&p, 2, Some(VariableType::Integer)),
            Synthesis::Failed("cannot read 'x' on type 'Integer'".into())
        );
        assert_eq!(
            with_parent_type(&p, 1, Some(VariableType::AssociativeArray)),
            Synthesis::Failed("cannot read 'count' on type 'AssociativeArray'".into())
        );
    }

    #[test]
    fn both_indices_are_ambiguous() {
        let data = ErrorData {
            missing_key_index: Some(1),
            invalid_path_index: Some(0),
        };
        assert!(matches!(
            synthesize(&path(&["a", "b"]), Some(&data)),
            Err(ClientError::AmbiguousVariableError)
        ));
    }

    #[test]
    fn out_of_range_index_passes_through() {
        assert_eq!(synthesize(&path(&["a"]), Some(&missing(4))).unwrap(), None);
        assert_eq!(synthesize(&path(&["a"]), Some(&invalid(-1))).unwrap(), None);
    }
}
