use taskrun_types::{Result, TaskrunError};
use winnow::combinator::{alt, cut_err, eof, opt, preceded};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::stream::Stream;
use winnow::token::{any, literal, take_till, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

fn expected(desc: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(desc))
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(expected(desc));
    ErrMode::Cut(e)
}

fn backtrack() -> ErrMode<ContextError<StrContext>> {
    ErrMode::Backtrack(ContextError::new())
}

fn is_hspace(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Horizontal whitespace only; newlines are handled by the line loop.
fn hws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(0.., is_hspace).parse_next(input)
}

fn hws1<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., is_hspace).parse_next(input)
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_-]*
pub(crate) fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        }),
    )
        .take()
        .parse_next(input)
}

/// Optional trailing `# comment`, then end of input.
fn line_end(input: &mut &str) -> ModalResult<()> {
    let _ = hws.parse_next(input)?;
    let _ = opt(preceded('#', take_while(0.., |_: char| true))).parse_next(input)?;
    let _ = eof.context(expected("end of line")).parse_next(input)?;
    Ok(())
}

// --- Literals ---

/// Double-quoted string with escape support.
fn cooked_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = cut_err(any.context(expected("closing `\"`"))).parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = cut_err(any.context(expected("escape sequence"))).parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Single-quoted string, taken verbatim.
fn raw_string(input: &mut &str) -> ModalResult<String> {
    let _ = '\''.parse_next(input)?;
    let body = take_till(0.., '\'').parse_next(input)?;
    let _ = cut_err('\''.context(expected("closing `'`"))).parse_next(input)?;
    Ok(body.to_string())
}

fn backtick(input: &mut &str) -> ModalResult<String> {
    let _ = '`'.parse_next(input)?;
    let body = take_till(0.., '`').parse_next(input)?;
    let _ = cut_err('`'.context(expected("closing backtick"))).parse_next(input)?;
    Ok(body.to_string())
}

fn any_string(input: &mut &str) -> ModalResult<String> {
    alt((cooked_string, raw_string)).parse_next(input)
}

// --- Expressions ---

fn group(input: &mut &str) -> ModalResult<Expression> {
    let _ = '('.parse_next(input)?;
    let _ = hws.parse_next(input)?;
    let inner = cut_err(expression).parse_next(input)?;
    let _ = hws.parse_next(input)?;
    let _ = cut_err(')'.context(expected("`)`"))).parse_next(input)?;
    Ok(Expression::Group(Box::new(inner)))
}

/// `name` or `name(arg, ...)`. The `(` must follow the name directly.
fn call_or_variable(input: &mut &str) -> ModalResult<Expression> {
    let name = identifier.parse_next(input)?;
    if opt('(').parse_next(input)?.is_none() {
        return Ok(Expression::Variable(name.to_string()));
    }

    let mut arguments = Vec::new();
    let _ = hws.parse_next(input)?;
    if opt(')').parse_next(input)?.is_none() {
        loop {
            arguments.push(cut_err(expression).parse_next(input)?);
            let _ = hws.parse_next(input)?;
            if opt(',').parse_next(input)?.is_some() {
                let _ = hws.parse_next(input)?;
                continue;
            }
            let _ = cut_err(')'.context(expected("`,` or `)`"))).parse_next(input)?;
            break;
        }
    }
    Ok(Expression::Call {
        name: name.to_string(),
        arguments,
    })
}

fn value(input: &mut &str) -> ModalResult<Expression> {
    alt((
        cooked_string.map(Expression::StringLiteral),
        raw_string.map(Expression::StringLiteral),
        backtick.map(Expression::Backtick),
        group,
        call_or_variable,
    ))
    .context(expected("expression"))
    .parse_next(input)
}

/// `value (('+' | '/') value)*`, left-associative, one precedence level.
pub(crate) fn expression(input: &mut &str) -> ModalResult<Expression> {
    let mut lhs = value.parse_next(input)?;
    loop {
        let checkpoint = input.checkpoint();
        let _ = hws.parse_next(input)?;
        match opt(alt(('+', '/'))).parse_next(input)? {
            Some(op) => {
                let _ = hws.parse_next(input)?;
                let rhs = cut_err(value).parse_next(input)?;
                lhs = if op == '+' {
                    Expression::Concat(Box::new(lhs), Box::new(rhs))
                } else {
                    Expression::Join(Box::new(lhs), Box::new(rhs))
                };
            }
            None => {
                input.reset(&checkpoint);
                break;
            }
        }
    }
    Ok(lhs)
}

// --- Top-level declarations ---

enum Header {
    Assignment {
        export: bool,
        name: String,
        expression: Expression,
    },
    Setting(Setting),
    Recipe {
        quiet: bool,
        name: String,
        parameters: Vec<Parameter>,
        dependencies: Vec<Dependency>,
    },
}

fn string_list(input: &mut &str) -> ModalResult<Vec<String>> {
    let _ = '['.parse_next(input)?;
    let mut items = Vec::new();
    loop {
        let _ = hws.parse_next(input)?;
        if opt(']').parse_next(input)?.is_some() {
            break;
        }
        items.push(cut_err(any_string.context(expected("string"))).parse_next(input)?);
        let _ = hws.parse_next(input)?;
        if opt(',').parse_next(input)?.is_none() {
            let _ = hws.parse_next(input)?;
            let _ = cut_err(']'.context(expected("`,` or `]`"))).parse_next(input)?;
            break;
        }
    }
    Ok(items)
}

fn boolean(input: &mut &str) -> ModalResult<bool> {
    alt((literal("true").value(true), literal("false").value(false))).parse_next(input)
}

/// `set shell := [...]`, `set export`, `set export := bool`
fn setting(input: &mut &str) -> ModalResult<Header> {
    let _ = literal("set").parse_next(input)?;
    let _ = hws1.parse_next(input)?;
    let name = identifier.parse_next(input)?;
    let _ = hws.parse_next(input)?;
    let assigned = opt(":=").parse_next(input)?.is_some();
    let _ = hws.parse_next(input)?;

    let setting = match (name, assigned) {
        ("shell", true) => Setting::Shell(
            cut_err(string_list.context(expected("list of strings"))).parse_next(input)?,
        ),
        ("export", true) => {
            Setting::Export(cut_err(boolean.context(expected("`true` or `false`"))).parse_next(input)?)
        }
        ("export", false) => Setting::Export(true),
        (_, true) => return Err(make_cut_error("`shell` or `export` setting")),
        // `set name:` is a recipe called `set`
        (_, false) => return Err(backtrack()),
    };
    cut_err(line_end).parse_next(input)?;
    Ok(Header::Setting(setting))
}

fn assignment_rest(input: &mut &str) -> ModalResult<Expression> {
    let _ = hws.parse_next(input)?;
    let expr = cut_err(expression).parse_next(input)?;
    cut_err(line_end).parse_next(input)?;
    Ok(expr)
}

fn exported_assignment(input: &mut &str) -> ModalResult<Header> {
    let _ = literal("export").parse_next(input)?;
    let _ = hws1.parse_next(input)?;
    let name = identifier.parse_next(input)?;
    let _ = hws.parse_next(input)?;
    let _ = ":=".parse_next(input)?;
    let expression = assignment_rest(input)?;
    Ok(Header::Assignment {
        export: true,
        name: name.to_string(),
        expression,
    })
}

fn plain_assignment(input: &mut &str) -> ModalResult<Header> {
    let name = identifier.parse_next(input)?;
    let _ = hws.parse_next(input)?;
    let _ = ":=".parse_next(input)?;
    let expression = assignment_rest(input)?;
    Ok(Header::Assignment {
        export: false,
        name: name.to_string(),
        expression,
    })
}

/// `'$'? ('*' | '+')? name ('=' value)?`
fn parameter(input: &mut &str) -> ModalResult<Parameter> {
    let export = opt('$').parse_next(input)?.is_some();
    let variadic = opt(alt(('*', '+'))).parse_next(input)?;
    let name = if export || variadic.is_some() {
        cut_err(identifier.context(expected("parameter name"))).parse_next(input)?
    } else {
        identifier.parse_next(input)?
    };
    let default = opt(preceded('=', cut_err(value))).parse_next(input)?;

    let kind = match (variadic, default) {
        (None, None) => ParameterKind::Required,
        (None, Some(value)) => ParameterKind::Default(value),
        (Some('*'), None) => ParameterKind::Star,
        (Some(_), None) => ParameterKind::Plus,
        (Some(_), Some(_)) => return Err(make_cut_error("variadic parameter without a default")),
    };
    Ok(Parameter {
        name: name.to_string(),
        kind,
        export,
    })
}

fn dependency_with_arguments(input: &mut &str) -> ModalResult<Dependency> {
    let _ = '('.parse_next(input)?;
    let _ = hws.parse_next(input)?;
    let recipe = cut_err(identifier.context(expected("recipe name"))).parse_next(input)?;
    let mut arguments = Vec::new();
    loop {
        let _ = hws.parse_next(input)?;
        if opt(')').parse_next(input)?.is_some() {
            break;
        }
        arguments.push(
            cut_err(expression.context(expected("dependency argument or `)`"))).parse_next(input)?,
        );
    }
    Ok(Dependency {
        recipe: recipe.to_string(),
        arguments,
    })
}

fn dependency(input: &mut &str) -> ModalResult<Dependency> {
    alt((
        identifier.map(|name: &str| Dependency {
            recipe: name.to_string(),
            arguments: Vec::new(),
        }),
        dependency_with_arguments,
    ))
    .context(expected("dependency"))
    .parse_next(input)
}

/// `'@'? name parameter* (':' dependency ((',' | ws) dependency)*)?`
fn recipe_header(input: &mut &str) -> ModalResult<Header> {
    let quiet = opt('@').parse_next(input)?.is_some();
    let name = cut_err(identifier.context(expected("recipe name, assignment or setting")))
        .parse_next(input)?;

    let mut parameters = Vec::new();
    loop {
        let checkpoint = input.checkpoint();
        let _ = hws.parse_next(input)?;
        match opt(parameter).parse_next(input)? {
            Some(p) => parameters.push(p),
            None => {
                input.reset(&checkpoint);
                break;
            }
        }
    }

    let _ = hws.parse_next(input)?;
    let mut dependencies = Vec::new();
    if opt(':').parse_next(input)?.is_some() {
        loop {
            let _ = hws.parse_next(input)?;
            if input.is_empty() || input.starts_with('#') {
                break;
            }
            dependencies.push(cut_err(dependency).parse_next(input)?);
            let _ = hws.parse_next(input)?;
            let _ = opt(',').parse_next(input)?;
        }
    }
    cut_err(line_end).parse_next(input)?;

    Ok(Header::Recipe {
        quiet,
        name: name.to_string(),
        parameters,
        dependencies,
    })
}

fn header(input: &mut &str) -> ModalResult<Header> {
    alt((setting, exported_assignment, plain_assignment, recipe_header)).parse_next(input)
}

// --- Error mapping ---

/// Run `parser` over the whole of `text` and map failures to a located
/// `ParseError`. `col_offset` is the number of characters before `text` on
/// its source line.
fn run<'i, O>(
    mut parser: impl Parser<&'i str, O, ErrMode<ContextError<StrContext>>>,
    text: &'i str,
    line: usize,
    col_offset: usize,
) -> Result<O> {
    let mut remaining = text;
    parser.parse_next(&mut remaining).map_err(|e| {
        let consumed = text.len() - remaining.len();
        let col = col_offset + text[..consumed].chars().count() + 1;
        parse_error(e, remaining, line, col, text)
    })
}

fn parse_error(
    err: ErrMode<ContextError<StrContext>>,
    remaining: &str,
    line: usize,
    col: usize,
    source_line: &str,
) -> TaskrunError {
    let reason = match err {
        ErrMode::Backtrack(e) | ErrMode::Cut(e) => e.to_string().replace('\n', ", "),
        ErrMode::Incomplete(_) => String::new(),
    };
    let reason = if reason.trim().is_empty() {
        "malformed declaration".to_string()
    } else {
        reason
    };
    let found = match remaining.split_whitespace().next() {
        Some(token) => format!("`{token}`"),
        None => "end of line".to_string(),
    };
    TaskrunError::ParseError {
        line,
        col,
        message: format!("{reason}, found {found}"),
        source_snippet: Some(source_line.to_string()),
    }
}

fn located_error(line: usize, col: usize, message: &str, source_line: &str) -> TaskrunError {
    TaskrunError::ParseError {
        line,
        col,
        message: message.to_string(),
        source_snippet: Some(source_line.to_string()),
    }
}

// --- Recipe bodies ---

fn push_text(fragments: &mut Vec<Fragment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Fragment::Text(last)) = fragments.last_mut() {
        last.push_str(text);
    } else {
        fragments.push(Fragment::Text(text.to_string()));
    }
}

/// Split one physical body line into literal text and `{{expr}}` holes.
/// `{{{{` is a literal `{{`.
fn parse_fragments(
    text: &str,
    line: usize,
    col_offset: usize,
    fragments: &mut Vec<Fragment>,
) -> Result<()> {
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        push_text(fragments, &rest[..open]);
        let after = &rest[open + 2..];
        if let Some(escaped) = after.strip_prefix("{{") {
            push_text(fragments, "{{");
            rest = escaped;
            continue;
        }

        let open_col = col_offset + text[..text.len() - rest.len() + open].chars().count() + 1;
        let Some(close) = after.find("}}") else {
            return Err(located_error(
                line,
                open_col,
                "unterminated interpolation, expected `}}`",
                text,
            ));
        };
        let inner = &after[..close];
        let inner_offset = col_offset + text[..text.len() - after.len()].chars().count();
        let expr = run(
            |input: &mut &str| -> ModalResult<Expression> {
                let _ = hws.parse_next(input)?;
                let e = cut_err(expression).parse_next(input)?;
                let _ = hws.parse_next(input)?;
                let _ = eof.context(expected("`}}`")).parse_next(input)?;
                Ok(e)
            },
            inner,
            line,
            inner_offset,
        )?;
        fragments.push(Fragment::Interpolation(expr));
        rest = &after[close + 2..];
    }
    push_text(fragments, rest);
    Ok(())
}

fn leading_whitespace(text: &str) -> &str {
    &text[..text.len() - text.trim_start_matches(is_hspace).len()]
}

/// Collect the indented body following a recipe header. Returns the lines
/// and how many source lines were consumed.
fn parse_body(lines: &[&str], first_number: usize) -> Result<(Vec<Line>, usize)> {
    let mut indent: Option<&str> = None;
    let mut body = Vec::new();
    let mut continuing: Option<Line> = None;
    let mut consumed = 0;

    while consumed < lines.len() {
        let raw = lines[consumed];
        if raw.trim().is_empty() {
            if let Some(line) = continuing.take() {
                body.push(line);
            }
            consumed += 1;
            continue;
        }
        if !raw.starts_with(is_hspace) {
            break;
        }

        let number = first_number + consumed;
        consumed += 1;

        let prefix = *indent.get_or_insert_with(|| leading_whitespace(raw));
        let Some(content) = raw.strip_prefix(prefix) else {
            return Err(located_error(
                number,
                1,
                "inconsistent indentation in recipe body",
                raw,
            ));
        };
        let col_offset = prefix.chars().count();

        let line = match continuing.take() {
            Some(mut line) => {
                push_text(&mut line.fragments, "\n");
                parse_fragments(content, number, col_offset, &mut line.fragments)?;
                line
            }
            None => {
                let (echo_toggle, text, offset) = match content.strip_prefix('@') {
                    Some(stripped) => (true, stripped, col_offset + 1),
                    None => (false, content, col_offset),
                };
                let mut fragments = Vec::new();
                parse_fragments(text, number, offset, &mut fragments)?;
                Line {
                    number,
                    echo_toggle,
                    fragments,
                }
            }
        };

        if content.ends_with('\\') {
            continuing = Some(line);
        } else {
            body.push(line);
        }
    }
    if let Some(line) = continuing {
        body.push(line);
    }
    Ok((body, consumed))
}

/// Public entry point.
pub fn parse(input: &str) -> Result<Document> {
    let lines: Vec<&str> = input.lines().collect();
    let mut items = Vec::new();
    let mut pending_doc: Option<String> = None;
    let mut index = 0;

    while index < lines.len() {
        let text = lines[index];
        let number = index + 1;
        index += 1;

        if text.trim().is_empty() {
            pending_doc = None;
            continue;
        }
        if text.starts_with(is_hspace) {
            let col = leading_whitespace(text).chars().count() + 1;
            return Err(located_error(
                number,
                col,
                "unexpected indentation outside of a recipe body",
                text,
            ));
        }
        if let Some(comment) = text.strip_prefix('#') {
            let comment = comment.trim();
            pending_doc = (!comment.is_empty()).then(|| comment.to_string());
            continue;
        }

        let doc = pending_doc.take();
        match run(header, text, number, 0)? {
            Header::Assignment {
                export,
                name,
                expression,
            } => items.push(Item::Assignment(Assignment {
                name,
                expression,
                export,
                doc,
                line: number,
            })),
            Header::Setting(setting) => items.push(Item::Setting(setting)),
            Header::Recipe {
                quiet,
                name,
                parameters,
                dependencies,
            } => {
                let (body, consumed) = parse_body(&lines[index..], index + 1)?;
                index += consumed;
                tracing::trace!(recipe = %name, lines = body.len(), "parsed recipe");
                items.push(Item::Recipe(Recipe {
                    name,
                    doc,
                    quiet,
                    parameters,
                    dependencies,
                    body,
                    line: number,
                }));
            }
        }
    }

    Ok(Document { items })
}
