/// Compile a regex literal once and hand out a `&'static Regex`.
///
/// Every engine-internal pattern (tag scanners, format blocks, syntax checks)
/// goes through this so the hot path never recompiles a fixed expression.
macro_rules! regex {
    ($pat:literal) => {{
        static RE: once_cell::sync::Lazy<regex::Regex> =
            once_cell::sync::Lazy::new(|| regex::Regex::new($pat).unwrap());
        &*RE
    }};
}
