fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Release pipelines without a .git directory pass the hash explicitly
    println!("cargo:rerun-if-env-changed=AGENTLOOP_GIT_HASH");
    if let Ok(hash) = std::env::var("AGENTLOOP_GIT_HASH") {
        println!("cargo:rustc-env=AGENTLOOP_GIT_HASH={}", hash);
    }
}
