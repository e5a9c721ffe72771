//! Build script for cudavec
//!
//! Selects the PTX embedded as `kernels32`. With the `cuda` feature and nvcc
//! available, `src/kernels/kernels32.cu` is compiled fresh; otherwise the
//! bundled `src/kernels/kernels32.ptx` is used.
//!
//! # Environment Variables
//!
//! - `CUDA_PATH`: Custom CUDA installation path (optional)

use std::env;
use std::path::PathBuf;

const KERNEL_SOURCE: &str = "src/kernels/kernels32.cu";
const BUNDLED_PTX: &str = "src/kernels/kernels32.ptx";

fn main() {
    println!("cargo:rerun-if-changed={KERNEL_SOURCE}");
    println!("cargo:rerun-if-changed={BUNDLED_PTX}");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));

    #[cfg(feature = "cuda")]
    let ptx = compile_kernels(&manifest_dir).unwrap_or_else(|| manifest_dir.join(BUNDLED_PTX));
    #[cfg(not(feature = "cuda"))]
    let ptx = manifest_dir.join(BUNDLED_PTX);

    println!("cargo:rustc-env=CUDAVEC_KERNELS32_PTX={}", ptx.display());
}

/// Compile `kernels32.cu` to PTX in OUT_DIR, or `None` to fall back.
#[cfg(feature = "cuda")]
fn compile_kernels(manifest_dir: &std::path::Path) -> Option<PathBuf> {
    use std::process::Command;

    let Some(nvcc) = find_nvcc() else {
        println!("cargo:warning=nvcc not found; using bundled kernels32.ptx");
        return None;
    };

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let ptx_path = out_dir.join("kernels32.ptx");
    let cu_path = manifest_dir.join(KERNEL_SOURCE);

    // sm_50 keeps the image loadable on every device the bundled PTX supports.
    let output = Command::new(&nvcc)
        .args(["-ptx", "-O3", "-arch=sm_50", "-o"])
        .arg(&ptx_path)
        .arg(&cu_path)
        .output();

    match output {
        Ok(output) if output.status.success() => Some(ptx_path),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines() {
                println!("cargo:warning=nvcc: {line}");
            }
            println!("cargo:warning=kernels32.cu failed to compile; using bundled kernels32.ptx");
            None
        }
        Err(e) => {
            println!("cargo:warning=failed to execute {nvcc}: {e}; using bundled kernels32.ptx");
            None
        }
    }
}

#[cfg(feature = "cuda")]
fn find_nvcc() -> Option<String> {
    use std::process::Command;

    if let Ok(cuda_path) = env::var("CUDA_PATH") {
        for name in ["nvcc", "nvcc.exe"] {
            let nvcc = PathBuf::from(&cuda_path).join("bin").join(name);
            if nvcc.exists() {
                return Some(nvcc.to_string_lossy().to_string());
            }
        }
    }

    let common_paths = [
        "/usr/local/cuda/bin/nvcc",
        "/usr/local/cuda-12/bin/nvcc",
        "/usr/local/cuda-11/bin/nvcc",
        "/opt/cuda/bin/nvcc",
    ];
    for path in common_paths {
        if std::path::Path::new(path).exists() {
            return Some(path.to_string());
        }
    }

    if Command::new("nvcc").arg("--version").output().is_ok() {
        return Some("nvcc".to_string());
    }

    None
}
