use std::fmt::Write;

use super::BencodeValue;


/// Renders a decoded value as nested human-readable text for diagnostic dumps. This does
///  work proportional to the tree size, so callers gate it behind debug verbosity.
///
/// Non-UTF-8 string bytes are rendered lossily; a log line is not a faithful wire dump.
pub fn pretty_print(value: &BencodeValue) -> String {
    let mut out = String::with_capacity(256);
    append(value, &mut out);
    out
}

fn append(el: &BencodeValue, out: &mut String) {
    match el {
        BencodeValue::Str(s) => {
            out.push('"');
            out.push_str(&String::from_utf8_lossy(s));
            out.push('"');
        }
        BencodeValue::Int(value) => {
            let _ = write!(out, "{}", value);
        }
        BencodeValue::List(items) => {
            out.push_str("[ ");
            let mut sep = "";
            for chld in items {
                out.push_str(sep);
                append(chld, out);
                sep = ", ";
            }
            out.push_str(" ]");
        }
        BencodeValue::Dict(pairs) => {
            out.push_str("{ ");
            let mut sep = "";
            for (key, value) in pairs {
                out.push_str(sep);
                out.push('"');
                out.push_str(&String::from_utf8_lossy(key));
                out.push('"');
                out.push_str(": ");
                append(value, out);
                sep = ", ";
            }
            out.push_str(" }");
        }
    }
}
