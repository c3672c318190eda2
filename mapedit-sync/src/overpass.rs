//! Syntactic validation of Overpass QL query text.
//!
//! The validator gates queries before any network request is issued. It
//! checks structure only — delimiter balance, string termination, and the
//! presence of a statement terminator — and reports the first error found
//! so the caller can surface an inline message. Semantic validation of tag
//! filters is left to the Overpass server.

use thiserror::Error;

/// The first structural error found in a query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The query contains nothing to submit.
    #[error("query is empty")]
    Empty,
    /// An opening or closing delimiter has no partner.
    #[error("unmatched `{delimiter}` at byte {position}")]
    UnbalancedDelimiter {
        /// The offending delimiter character.
        delimiter: char,
        /// Byte offset of the offender.
        position: usize,
    },
    /// A quoted string never closes.
    #[error("unterminated string starting at byte {position}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        position: usize,
    },
    /// The query has no `;` statement terminator outside quotes.
    #[error("query has no `;` statement terminator")]
    MissingTerminator,
}

/// Validate Overpass QL text.
///
/// # Examples
///
/// ```
/// use mapedit_sync::validate_query;
///
/// assert!(validate_query("node[\"amenity\"=\"cafe\"];out;").is_ok());
/// assert!(validate_query("**").is_err());
/// ```
///
/// # Errors
///
/// The first structural [`QueryError`] found, scanning left to right.
pub fn validate_query(query: &str) -> Result<(), QueryError> {
    if query.trim().is_empty() {
        return Err(QueryError::Empty);
    }

    let mut open_stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<(char, usize)> = None;
    let mut escaped = false;
    let mut terminated = false;

    for (position, ch) in query.char_indices() {
        if let Some((quote_char, _)) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote_char {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some((ch, position)),
            '(' | '[' | '{' => open_stack.push((ch, position)),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match open_stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        return Err(QueryError::UnbalancedDelimiter {
                            delimiter: ch,
                            position,
                        });
                    }
                }
            }
            ';' => terminated = true,
            _ => {}
        }
    }

    if let Some((_, position)) = quote {
        return Err(QueryError::UnterminatedString { position });
    }
    if let Some((delimiter, position)) = open_stack.pop() {
        return Err(QueryError::UnbalancedDelimiter {
            delimiter,
            position,
        });
    }
    if !terminated {
        return Err(QueryError::MissingTerminator);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("node(50.7,7.1,50.8,7.25);out;")]
    #[case("[out:json];node[\"amenity\"=\"cafe\"]({{bbox}});out body;")]
    #[case("way[\"name\"=\"semi;colon\"];out;")]
    fn accepts_well_formed_queries(#[case] query: &str) {
        assert_eq!(validate_query(query), Ok(()));
    }

    #[rstest]
    #[case("")]
    #[case("   \n\t")]
    fn rejects_empty_queries(#[case] query: &str) {
        assert_eq!(validate_query(query), Err(QueryError::Empty));
    }

    #[rstest]
    fn rejects_the_classic_invalid_query() {
        // The shortest query users actually type into the form.
        assert_eq!(validate_query("**"), Err(QueryError::MissingTerminator));
    }

    #[rstest]
    fn reports_the_first_unmatched_closer() {
        assert_eq!(
            validate_query("node[\"a\"]);out;"),
            Err(QueryError::UnbalancedDelimiter {
                delimiter: ')',
                position: 9,
            })
        );
    }

    #[rstest]
    fn reports_a_dangling_opener() {
        assert_eq!(
            validate_query("node[\"amenity\";out;"),
            Err(QueryError::UnbalancedDelimiter {
                delimiter: '[',
                position: 4,
            })
        );
    }

    #[rstest]
    fn reports_unterminated_strings() {
        assert_eq!(
            validate_query("node[\"amenity];out;"),
            Err(QueryError::UnterminatedString { position: 5 })
        );
    }

    #[rstest]
    fn delimiters_inside_strings_are_ignored() {
        assert_eq!(validate_query("node[\"smiley=:)\"];out;"), Ok(()));
    }

    #[rstest]
    fn escaped_quotes_do_not_close_strings() {
        assert_eq!(validate_query(r#"node["name"="say \"hi\""];out;"#), Ok(()));
    }

    #[rstest]
    fn mismatched_pair_is_rejected() {
        assert!(matches!(
            validate_query("node(50.7,7.1];out;"),
            Err(QueryError::UnbalancedDelimiter { delimiter: ']', .. })
        ));
    }
}
