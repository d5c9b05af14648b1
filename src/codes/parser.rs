//! Line parser for G/M/T-codes and flow-control keywords.
//!
//! One call parses one physical line. The caller supplies source context
//! (channel, byte position, line number); parse failures come back as plain
//! strings and are wrapped into `Error::CodeParser` with file context by the
//! interpreter.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{anychar, char, digit1, one_of, space0},
    combinator::{map, opt, recognize},
    sequence::{pair, preceded},
    IResult,
};

use super::{Code, CodeType, Keyword, Parameter};

/// Parse one line into a [`Code`].
///
/// `line` must not contain the trailing newline. Empty lines yield a code of
/// type `None`; pure comment lines yield type `Comment`. Lines starting with
/// a bare axis word (`X10 Y5`, CNC/Laser style with the major number left
/// off) yield type `None` with parameters attached.
pub fn parse_line(line: &str) -> Result<Code, String> {
    let mut code = Code::default();

    let without_indent = line.trim_start_matches([' ', '\t']);
    code.indent = (line.len() - without_indent.len()).min(u8::MAX as usize) as u8;

    let body = without_indent.trim_end();
    if body.is_empty() {
        return Ok(code);
    }

    // Whole-line comments.
    if let Some(text) = body.strip_prefix(';') {
        code.code_type = CodeType::Comment;
        code.comment = Some(text.to_string());
        return Ok(code);
    }
    if body.starts_with('(') && body.ends_with(')') && !body[1..body.len() - 1].contains(')') {
        code.code_type = CodeType::Comment;
        code.comment = Some(body[1..body.len() - 1].to_string());
        return Ok(code);
    }

    // Flow-control keywords.
    let word = body
        .split([' ', '\t'])
        .next()
        .unwrap_or_default();
    if let Some(keyword) = keyword_of(word) {
        return parse_keyword_line(code, keyword, body[word.len()..].trim());
    }

    parse_code_line(code, body)
}

fn keyword_of(word: &str) -> Option<Keyword> {
    match word {
        "if" => Some(Keyword::If),
        "elif" => Some(Keyword::ElseIf),
        "else" => Some(Keyword::Else),
        "while" => Some(Keyword::While),
        "break" => Some(Keyword::Break),
        "continue" => Some(Keyword::Continue),
        "abort" => Some(Keyword::Abort),
        "var" => Some(Keyword::Var),
        "global" => Some(Keyword::Global),
        "set" => Some(Keyword::Set),
        "echo" => Some(Keyword::Echo),
        "return" => Some(Keyword::Return),
        _ => None,
    }
}

fn parse_keyword_line(mut code: Code, keyword: Keyword, argument: &str) -> Result<Code, String> {
    code.code_type = CodeType::Keyword;
    code.keyword = Some(keyword);

    let argument = strip_trailing_comment(argument);
    match keyword {
        Keyword::If | Keyword::ElseIf | Keyword::While if argument.is_empty() => {
            return Err(format!("missing condition after '{}'", keyword.as_str()));
        }
        Keyword::Var | Keyword::Global | Keyword::Set if argument.is_empty() => {
            return Err(format!("missing assignment after '{}'", keyword.as_str()));
        }
        Keyword::Else | Keyword::Break | Keyword::Continue if !argument.is_empty() => {
            return Err(format!("unexpected argument after '{}'", keyword.as_str()));
        }
        _ => {}
    }
    if !argument.is_empty() {
        code.keyword_argument = Some(argument.to_string());
    }
    Ok(code)
}

fn parse_code_line(mut code: Code, body: &str) -> Result<Code, String> {
    // Optional line-number word, accepted and discarded.
    let rest = match line_number_word(body) {
        Ok((rest, _)) => rest.trim_start(),
        Err(_) => body,
    };

    let mut rest = match code_word(rest) {
        Ok((rest, (code_type, major, minor))) => {
            code.code_type = code_type;
            code.major = major;
            code.minor = minor;
            rest
        }
        // CNC/Laser style line without a repeated major number.
        Err(_) => rest,
    };

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(text) = rest.strip_prefix(';') {
            code.comment = Some(text.trim_end().to_string());
            break;
        }
        if rest.starts_with('(') {
            match rest.find(')') {
                Some(end) => {
                    rest = &rest[end + 1..];
                    continue;
                }
                None => return Err("unterminated parenthesized comment".to_string()),
            }
        }
        let (next, parameter) = parameter(rest).map_err(|_| {
            format!("invalid parameter near '{}'", rest.chars().take(12).collect::<String>())
        })?;
        code.parameters.push(parameter);
        rest = next;
    }

    if code.code_type == CodeType::None && code.parameters.is_empty() && code.comment.is_none() {
        return Err("empty code line".to_string());
    }
    Ok(code)
}

fn strip_trailing_comment(argument: &str) -> &str {
    // Keywords take expressions; a ';' outside quotes starts a comment.
    let mut in_string = false;
    for (index, ch) in argument.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            ';' if !in_string => return argument[..index].trim_end(),
            _ => {}
        }
    }
    argument
}

// ============================================================================
// nom word parsers
// ============================================================================

fn line_number_word(input: &str) -> IResult<&str, &str> {
    recognize(pair(one_of("Nn"), digit1))(input)
}

fn code_word(input: &str) -> IResult<&str, (CodeType, Option<i32>, Option<i8>)> {
    let (input, letter) = one_of("GgMmTt")(input)?;
    let code_type = match letter.to_ascii_uppercase() {
        'G' => CodeType::G,
        'M' => CodeType::M,
        _ => CodeType::T,
    };
    let (input, major) = opt(map(digit1, |d: &str| d.parse::<i32>().unwrap_or(0)))(input)?;
    let (input, minor) = opt(preceded(
        char('.'),
        map(digit1, |d: &str| d.parse::<i8>().unwrap_or(0)),
    ))(input)?;

    // A bare T may still be valid ("T" or "T{expr}"), but a bare G/M word
    // followed by nothing parsable is not a code.
    if major.is_none() && code_type != CodeType::T {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        )));
    }
    Ok((input, (code_type, major, minor)))
}

fn parameter(input: &str) -> IResult<&str, Parameter> {
    let (input, letter) = parameter_letter(input)?;
    let (input, _) = space0(input)?;
    alt((
        map(quoted_string, move |s| Parameter {
            letter,
            value: s,
            is_expression: false,
            is_string: true,
        }),
        map(expression, move |e: &str| Parameter {
            letter,
            value: e.to_string(),
            is_expression: true,
            is_string: false,
        }),
        map(bare_value, move |v: &str| Parameter {
            letter,
            value: v.to_string(),
            is_expression: false,
            is_string: false,
        }),
    ))(input)
}

fn parameter_letter(input: &str) -> IResult<&str, char> {
    let (rest, ch) = anychar(input)?;
    if ch.is_ascii_alphabetic() || ch == '\'' {
        Ok((rest, ch))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alpha,
        )))
    }
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = tag("\"")(input)?;
    let mut value = String::new();
    loop {
        match rest.find('"') {
            Some(index) => {
                value.push_str(&rest[..index]);
                rest = &rest[index + 1..];
                // Doubled quotes escape a literal quote.
                if let Some(stripped) = rest.strip_prefix('"') {
                    value.push('"');
                    rest = stripped;
                } else {
                    return Ok((rest, value));
                }
            }
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Tag,
                )))
            }
        }
    }
}

/// `{…}` expression with balanced braces.
fn expression(input: &str) -> IResult<&str, &str> {
    let (_, _) = tag("{")(input)?;
    let mut depth = 0usize;
    for (index, ch) in input.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&input[index + 1..], &input[1..index]));
                }
            }
            _ => {}
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::TakeUntil,
    )))
}

fn bare_value(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| !c.is_whitespace() && c != ';')(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::CodeType;

    #[test]
    fn parses_plain_gcode() {
        let code = parse_line("G1 X10.5 Y-2 F3000").unwrap();
        assert_eq!(code.code_type, CodeType::G);
        assert_eq!(code.major, Some(1));
        assert_eq!(code.parameters.len(), 3);
        assert_eq!(code.parameter('x').unwrap().as_float(), Some(10.5));
        assert_eq!(code.parameter('Y').unwrap().as_int(), Some(-2));
    }

    #[test]
    fn parses_minor_number() {
        let code = parse_line("G53.4").unwrap();
        assert_eq!(code.major, Some(53));
        assert_eq!(code.minor, Some(4));
    }

    #[test]
    fn parses_string_parameter() {
        let code = parse_line("M550 P\"my \"\"printer\"\"\"").unwrap();
        let p = code.parameter('P').unwrap();
        assert!(p.is_string);
        assert_eq!(p.value, "my \"printer\"");
    }

    #[test]
    fn parses_expression_parameter() {
        let code = parse_line("G1 X{move.axes[0].max - 5}").unwrap();
        let p = code.parameter('X').unwrap();
        assert!(p.is_expression);
        assert_eq!(p.value, "move.axes[0].max - 5");
    }

    #[test]
    fn parses_keywords_and_indent() {
        let code = parse_line("  while iterations < 3").unwrap();
        assert_eq!(code.indent, 2);
        assert!(code.is_keyword(Keyword::While));
        assert_eq!(code.keyword_argument.as_deref(), Some("iterations < 3"));

        let code = parse_line("else").unwrap();
        assert!(code.is_keyword(Keyword::Else));
        assert!(code.keyword_argument.is_none());
    }

    #[test]
    fn rejects_condition_less_if() {
        assert!(parse_line("if").is_err());
        assert!(parse_line("else something").is_err());
    }

    #[test]
    fn comment_lines_and_trailing_comments() {
        let code = parse_line("; just a note").unwrap();
        assert_eq!(code.code_type, CodeType::Comment);

        let code = parse_line("G28 ; home").unwrap();
        assert_eq!(code.code_type, CodeType::G);
        assert_eq!(code.comment.as_deref(), Some("home"));
    }

    #[test]
    fn line_number_word_is_discarded() {
        let code = parse_line("N42 G28 X").unwrap();
        assert_eq!(code.code_type, CodeType::G);
        assert_eq!(code.major, Some(28));
    }

    #[test]
    fn cnc_style_axis_words_without_major() {
        let code = parse_line("X10 Y20").unwrap();
        assert_eq!(code.code_type, CodeType::None);
        assert_eq!(code.parameters.len(), 2);
    }

    #[test]
    fn empty_line_is_type_none() {
        let code = parse_line("   ").unwrap();
        assert_eq!(code.code_type, CodeType::None);
        assert!(code.parameters.is_empty());
    }
}
