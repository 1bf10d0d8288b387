/// Custom uniffi-bindgen binary for generating language bindings.
///
/// This binary uses the UniFFI bindgen API to generate Python/Kotlin/Swift
/// bindings from the compiled edge-llm-uniffi cdylib.
///
/// Usage:
///   cargo run -p edge-llm-uniffi --bin edge-llm-uniffi-bindgen -- \
///     generate --library -l python -o bindings/python \
///     target/release/libedge_llm_uniffi.so
fn main() {
    uniffi::uniffi_bindgen_main();
}
