use std::env;
use std::fs;
use std::path::Path;

// Build-time defaults. Each can be overridden with a MARTEN_* environment
// variable when compiling, the same way a server would stamp per-operation
// values into the binary.
const DEFAULTS: &[(&str, &str)] = &[
    ("MARTEN_KEY", "P4XDQCJDOJRDJYBGCQA1KDOIYRWBHEWQ"),
    ("MARTEN_SERVER", "http://localhost:8888"),
    ("MARTEN_PAW", ""),
    ("MARTEN_GROUP", "red"),
    ("MARTEN_C2_NAME", "HTTP"),
    ("MARTEN_C2_KEY", ""),
    // Kept as a string so the build environment can pass any truthy form.
    ("MARTEN_LISTEN_P2P", "false"),
    ("MARTEN_HTTP_PROXY_GATEWAY", ""),
    // base64(xor(json(map of receiver protocol -> addresses))), empty when
    // no peers are baked in.
    ("MARTEN_ENCODED_RECEIVERS", ""),
    ("MARTEN_RECEIVER_KEY", ""),
];

fn main() {
    let mut generated = String::new();
    for (var, default) in DEFAULTS {
        let value = env::var(var).unwrap_or_else(|_| default.to_string());
        let const_name = var.trim_start_matches("MARTEN_");
        generated.push_str(&format!(
            "pub const DEFAULT_{}: &str = {:?};\n",
            const_name, value
        ));
        println!("cargo:rerun-if-env-changed={}", var);
    }

    let out_dir = env::var_os("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("config.rs");
    fs::write(&dest_path, generated).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
