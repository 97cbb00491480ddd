// SPDX-License-Identifier: CEPL-1.0
use std::{env, path::PathBuf};

fn main() {
    let manifest = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let src = manifest.join("shaders");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", src.display());

    #[cfg(feature = "compile-shaders")]
    {
        let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
        compile::all(&src, &out);
        println!("cargo:rustc-env=KEEL_SHADER_DIR={}", out.display());
    }
    #[cfg(not(feature = "compile-shaders"))]
    println!("cargo:rustc-env=KEEL_SHADER_DIR={}", src.display());
}

#[cfg(feature = "compile-shaders")]
mod compile {
    use std::{fs, path::Path};

    pub fn all(src: &Path, out: &Path) {
        let comp = shaderc::Compiler::new().expect("shaderc compiler");
        let mut opts = shaderc::CompileOptions::new().expect("shaderc options");
        opts.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_3 as u32);
        opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

        for (name, kind) in [
            ("mesh.vert", shaderc::ShaderKind::Vertex),
            ("mesh.frag", shaderc::ShaderKind::Fragment),
        ] {
            let path = src.join(name);
            let text = fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
            let spv = comp
                .compile_into_spirv(&text, kind, name, "main", Some(&opts))
                .unwrap_or_else(|e| panic!("{name}: {e}"));
            fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8()).expect("write spv");
        }
    }
}
