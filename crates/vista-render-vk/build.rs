// SPDX-License-Identifier: CEPL-1.0
use std::{env, fs, path::PathBuf};

// Vertex shader shared by both shader sets. Layout matches `Vertex`:
//   - binding 0, location 0: R32G32_SFLOAT (pos)
//   - binding 0, location 1: R32G32B32_SFLOAT (color)
//   - binding 0, location 2: R32G32_SFLOAT (uv)
const VERT_SRC: &str = r#"
#version 450
layout(set = 0, binding = 0) uniform Transform {
    mat4 model;
    mat4 view;
    mat4 proj;
} u;

layout(location = 0) in vec2 inPos;
layout(location = 1) in vec3 inColor;
layout(location = 2) in vec2 inUv;

layout(location = 0) out vec3 vColor;
layout(location = 1) out vec2 vUv;

void main() {
    gl_Position = u.proj * u.view * u.model * vec4(inPos, 0.0, 1.0);
    vColor = inColor;
    vUv = inUv;
}
"#;

const FRAG_COLORED_SRC: &str = r#"
#version 450
layout(location = 0) in vec3 vColor;
layout(location = 1) in vec2 vUv;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0);
}
"#;

const FRAG_TEXTURED_SRC: &str = r#"
#version 450
layout(set = 0, binding = 1) uniform sampler2D tex;

layout(location = 0) in vec3 vColor;
layout(location = 1) in vec2 vUv;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0) * texture(tex, vUv);
}
"#;

fn compile(
    comp: &shaderc::Compiler,
    opts: &shaderc::CompileOptions,
    src: &str,
    kind: shaderc::ShaderKind,
    name: &str,
) -> Vec<u8> {
    comp.compile_into_spirv(src, kind, name, "main", Some(opts))
        .unwrap_or_else(|e| panic!("compiling {name}: {e}"))
        .as_binary_u8()
        .to_vec()
}

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap()).join("shaders");

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let vert = compile(&comp, &opts, VERT_SRC, shaderc::ShaderKind::Vertex, "quad.vert");
    let sets = [
        ("colored", FRAG_COLORED_SRC, "colored.frag"),
        ("textured", FRAG_TEXTURED_SRC, "textured.frag"),
    ];
    for (dir, frag_src, frag_name) in sets {
        let frag = compile(&comp, &opts, frag_src, shaderc::ShaderKind::Fragment, frag_name);
        let dir = out.join(dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vert.spv"), &vert).unwrap();
        fs::write(dir.join("frag.spv"), frag).unwrap();
    }

    // Re-run if this file changes (inline sources live here)
    println!("cargo:rerun-if-changed=build.rs");
}
