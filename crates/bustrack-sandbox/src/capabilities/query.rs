//! DOM queries over HTML strings: `query`, `query_attr`, `query_html`.
//!
//! Selectors are CSS. A selector starting with `/` is read as a simple
//! absolute XPath and converted first (`/html/body/div[2]` becomes
//! `html > body > div:nth-of-type(2)`).

use bustrack_core::Value;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

use crate::capability::{CapabilityTable, string_arg};
use crate::error::ScriptError;

static XPATH_INDEX: OnceLock<Option<Regex>> = OnceLock::new();

pub fn register(table: &mut CapabilityTable) {
    table.register_fn("query", Some(2), |args, _| {
        select("query", &args, |el| Value::String(element_text(&el)))
    });
    table.register_fn("query_attr", Some(3), |args, _| {
        let attribute = string_arg("query_attr", &args, 2)?;
        select("query_attr", &args, |el| {
            el.value()
                .attr(&attribute)
                .map(Value::from)
                .unwrap_or(Value::Null)
        })
    });
    table.register_fn("query_html", Some(2), |args, _| {
        select("query_html", &args, |el| Value::String(el.inner_html()))
    });
}

/// Convert an absolute XPath of plain steps into a CSS child selector.
pub fn xpath_to_css(xpath: &str) -> Result<String, String> {
    if xpath.is_empty() {
        return Err("xpath should not be empty".into());
    }
    let Some(path) = xpath.strip_prefix('/') else {
        return Err("xpath should start with /".into());
    };
    let selector = path
        .split('/')
        .filter(|step| !step.is_empty())
        .collect::<Vec<_>>()
        .join(" > ");
    let re = XPATH_INDEX
        .get_or_init(|| Regex::new(r"\[(\d+)\]").ok())
        .as_ref()
        .ok_or_else(|| "xpath index pattern unavailable".to_string())?;
    Ok(re.replace_all(&selector, ":nth-of-type($1)").into_owned())
}

fn parse_selector(name: &str, raw: &str) -> Result<Selector, ScriptError> {
    let css = if raw.starts_with('/') || raw.is_empty() {
        xpath_to_css(raw).map_err(|e| ScriptError::capability(name, e))?
    } else {
        raw.to_string()
    };
    Selector::parse(&css)
        .map_err(|e| ScriptError::capability(name, format!("invalid selector '{css}': {e}")))
}

fn select(
    name: &str,
    args: &[Value],
    project: impl Fn(ElementRef<'_>) -> Value,
) -> Result<Value, ScriptError> {
    let html = string_arg(name, args, 0)?;
    let selector = parse_selector(name, &string_arg(name, args, 1)?)?;
    let document = Html::parse_document(&html);
    Ok(Value::List(document.select(&selector).map(project).collect()))
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
