fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=ORT_LIB_LOCATION");

    // Only the classifier build links ONNX Runtime
    if std::env::var_os("CARGO_FEATURE_ONNX").is_none() {
        return;
    }

    // A local SDK takes precedence over the onnxruntime-sys download
    let Ok(sdk_path) = std::env::var("ORT_LIB_LOCATION") else {
        return;
    };

    println!("cargo:warning=Using ONNX Runtime SDK from: {}", sdk_path);
    println!("cargo:include={}/include", sdk_path);
    println!("cargo:rustc-link-search=native={}/lib", sdk_path);
    println!("cargo:rustc-link-lib=dylib=onnxruntime");
}
