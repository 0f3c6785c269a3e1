//! Settings-to-instruction compiler.
//!
//! Template selection, not free text generation: each mode has a handful of
//! named workflows selected by a sentinel value of the prompt hint, and each
//! workflow renders a fixed section ordering. Semantically meaningful
//! booleans always emit an explicit ENGAGED/DISENGAGED line so the provider
//! is told what *not* to do; cosmetic free-text fields are skipped silently
//! when empty. Identical inputs always yield byte-identical text.

use std::fmt::Write as _;

use atelier_contracts::mask::MaskConvention;
use atelier_contracts::models::Provider;
use atelier_contracts::modes::{
    BackgroundProcessing, CompositeSettings, CreativeSettings, ModeSettings, PortraitSettings,
    RestoreSettings,
};

/// One-click portrait remaster workflow trigger.
pub const INSTANT_STUDIO_REMASTER: &str = "INSTANT_STUDIO_REMASTER";
/// Creative background-replacement workflow trigger.
pub const STUDIO_SWAP: &str = "STUDIO_SWAP";
/// Creative canvas-extension workflow trigger.
pub const FULL_BODY_GENERATION: &str = "FULL_BODY_GENERATION";

/// Compiles the active settings into the instruction text for `provider`.
///
/// The inline-multimodal provider receives the full workflow template; the
/// form-upload provider receives a condensed scene description (its
/// endpoints take an image prompt, not an edit script).
pub fn compile(
    provider: Provider,
    settings: &ModeSettings,
    prompt_hint: &str,
    mask: Option<MaskConvention>,
    has_reference: bool,
) -> String {
    match provider {
        Provider::Gemini => compile_workflow(settings, prompt_hint, mask, has_reference),
        Provider::OpenAi => compile_condensed(settings, prompt_hint),
    }
}

fn compile_workflow(
    settings: &ModeSettings,
    prompt_hint: &str,
    mask: Option<MaskConvention>,
    has_reference: bool,
) -> String {
    match settings {
        ModeSettings::Portrait(portrait) => portrait_workflow(portrait, prompt_hint),
        ModeSettings::Restore(restore) => restore_workflow(restore),
        ModeSettings::Creative(creative) => {
            creative_workflow(creative, prompt_hint, mask, has_reference)
        }
        ModeSettings::Composite(composite) => composite_workflow(composite, prompt_hint),
    }
}

fn portrait_workflow(settings: &PortraitSettings, prompt_hint: &str) -> String {
    let mut out = String::new();
    if prompt_hint == INSTANT_STUDIO_REMASTER {
        out.push_str(
            "CRITICAL TASK: Perform an INSTANT STUDIO REMASTER. This is an automated one-click \
             process. Execute the following professional studio workflow with optimal settings \
             to transform the input photo into a hyper-realistic, 8K masterpiece.\n\n\
             **User's primary instruction:** \"Make this portrait look like it was shot in a \
             professional studio with high-end equipment.\"\n\n",
        );
    } else {
        let instruction = if prompt_hint.is_empty() {
            "Enhance this portrait based on the parameters below."
        } else {
            prompt_hint
        };
        let _ = write!(
            out,
            "CRITICAL TASK: Perform a custom studio-quality portrait enhancement based on the \
             user's settings.\n\n**User's primary instruction:** \"{instruction}\"\n\n"
        );
    }

    out.push_str("---\n**WORKFLOW & PARAMETERS:**\n\n");
    out.push_str("**STEP 1: CORE ENGINE - IDENTITY & DETAIL**\n");
    out.push_str(
        "- **Identity-Lock: CRITICAL - 100% PRESERVATION.** The subject's facial features and \
         identity must not be altered.\n",
    );
    let _ = writeln!(
        out,
        "- **Generative Upscale Target:** Reconstruct the image to a target resolution of \
         **{}**.",
        settings.target_resolution
    );
    if settings.auto_skin_texture {
        out.push_str(
            "- **Auto-Skin Texture:** ENGAGED. Generate realistic, high-frequency skin texture, \
             including pores and micro-details.\n",
        );
    }
    if settings.auto_hair_detail {
        out.push_str(
            "- **Auto-Hair Detail:** ENGAGED. Reconstruct individual, sharp strands of hair.\n",
        );
    }

    out.push_str("\n**STEP 2: DYNAMIC STUDIO RELIGHTING**\n");
    out.push_str(
        "- **Lighting Analysis:** First, analyze the original lighting for flaws like harsh \
         shadows or blown-out highlights.\n",
    );
    if settings.auto_balance_lighting {
        let _ = writeln!(
            out,
            "- **Auto-Relighting:** ENGAGED. Neutralize the original flawed lighting and \
             re-light the subject virtually using a professional **'{}'** setup. The goal is \
             balanced, dimensional light.\n- **Light Intensity:** Set to approximately {}%.",
            settings.light_style, settings.light_intensity
        );
    } else {
        out.push_str(
            "- **Auto-Relighting:** DISENGAGED. Preserve and enhance the original lighting \
             only.\n",
        );
    }

    out.push_str("\n**STEP 3: PROFESSIONAL LENS & CAMERA FX**\n");
    if settings.auto_bokeh {
        let _ = writeln!(
            out,
            "- **Depth of Field:** ENGAGED. Perform a precise subject-background separation.\n  \
             - **Lens Profile:** Simulate a **'{}'** lens to create a beautiful, creamy \
             bokeh.\n  - **Background Blur:** Set blur intensity to approximately {}%.",
            settings.lens_profile, settings.background_blur
        );
    } else {
        out.push_str(
            "- **Depth of Field:** DISENGAGED. Maintain the original background focus.\n",
        );
    }
    if settings.chromatic_aberration {
        out.push_str(
            "- **Lens Simulation:** Add subtle chromatic aberration for enhanced \
             photorealism.\n",
        );
    }

    out.push_str("\n**STEP 4: BEAUTY & STYLE**\n");
    out.push_str("- **Hyper-Real Skin Finishing:**\n");
    let _ = writeln!(
        out,
        "  - **Smoothing:** Apply a natural skin smoothing effect at {}%, preserving skin \
         texture. This should NOT look like plastic.",
        settings.skin_smoothing
    );
    let mut removals: Vec<&str> = Vec::new();
    if settings.remove_blemishes {
        removals.push("acne and spots");
    }
    if settings.remove_wrinkles {
        removals.push("wrinkles");
    }
    if settings.remove_dark_circles {
        removals.push("dark under-eye circles");
    }
    if removals.is_empty() {
        out.push_str("  - **Blemish Removal:** No specific blemish removal requested.\n");
    } else {
        let _ = writeln!(out, "  - **Blemish Removal:** Remove {}.", removals.join(", "));
    }
    if !settings.makeup.is_empty() {
        let _ = writeln!(
            out,
            "- **Makeup Style:** Apply makeup as described: \"{}\".",
            settings.makeup
        );
    }
    if !settings.hair.is_empty() {
        let _ = writeln!(
            out,
            "- **Hair Style:** Modify hair as described: \"{}\".",
            settings.hair
        );
    }

    out.push_str(
        "\n**FINAL INSTRUCTION:** Execute this multi-step process to transform the portrait. \
         The result must be hyper-realistic, detailed, and indistinguishable from a high-end \
         professional studio photograph.",
    );
    out
}

fn restore_workflow(settings: &RestoreSettings) -> String {
    let mut out = String::new();
    let context = if settings.context.is_empty() {
        "No specific context provided."
    } else {
        settings.context.as_str()
    };
    let _ = write!(
        out,
        "CRITICAL TASK: Perform a hyper-realistic, studio-quality photo restoration. The goal \
         is to make the restored photo indistinguishable from a modern, high-resolution \
         photograph of the original scene, finished with professional studio techniques. It \
         must be a 100% faithful restoration of the subject's identity.\n\n\
         **User-provided context:** \"{context}\"\n\n---\n**RESTORATION WORKFLOW:**\n\n"
    );

    out.push_str("**STEP 1: ANALYSIS & CLEANING**\n");
    out.push_str(
        "- Analysis: You are an expert photo restoration AI. Analyze the image for all forms \
         of degradation.\n",
    );
    if settings.auto_clean {
        out.push_str(
            "- Damage & Noise Removal: ENGAGED. Automatically remove all scratches, stains, \
             mold, and film grain without losing core details. Prepare a clean base image.\n",
        );
    } else {
        out.push_str(
            "- Damage & Noise Removal: DISENGAGED. Preserve original grain and minor \
             imperfections.\n",
        );
    }

    out.push_str("\n**STEP 2: CORE REMASTERING**\n");
    out.push_str(
        "- Identity-Lock: CRITICAL - 100% PRESERVATION. The subject's facial features and \
         identity must not be altered.\n",
    );
    if settings.hyper_real_skin {
        out.push_str(
            "- Hyper-Real Skin Texture: ENGAGED. Generate realistic skin texture, including \
             pores and micro-details, appropriate for the subject's age.\n",
        );
    }
    if settings.hair_and_fabric_details {
        out.push_str(
            "- Hair & Fabric Detail Generation: ENGAGED. Reconstruct individual strands of \
             hair and the fine texture of clothing fabric for maximum realism.\n",
        );
    }
    let _ = writeln!(
        out,
        "- Target Resolution: Upscale the final output to {}.",
        settings.resolution
    );

    out.push_str("\n**STEP 3: STUDIO FINISHING**\n");
    if settings.auto_studio_light {
        let _ = writeln!(
            out,
            "- Studio Relighting: ENGAGED. Remove the original, often flat or poor, lighting. \
             Re-light the subject using a virtual '{}' setup to create depth, dimension, and a \
             professional look.",
            settings.light_style
        );
    } else {
        out.push_str(
            "- Studio Relighting: PRESERVE ORIGINAL LIGHTING. Only enhance, do not replace, \
             the original lighting.\n",
        );
    }
    if settings.modern_auto_color {
        out.push_str(
            "- Modern Colorization: ENGAGED. Apply vibrant, realistic colors as if shot with a \
             modern digital camera.\n",
        );
    }
    if settings.auto_white_balance {
        out.push_str(
            "- Auto White Balance: ENGAGED. Correct any color casts to ensure neutral tones \
             and accurate skin colors.\n",
        );
    }
    match settings.background_processing {
        BackgroundProcessing::Remaster => out.push_str(
            "- Background Processing: Remaster the original background. Enhance its details \
             and match its lighting and color to the relit subject.\n",
        ),
        BackgroundProcessing::NewStudio => {
            let _ = writeln!(
                out,
                "- Background Processing: Replace the original background with a new, clean \
                 studio backdrop.\n  - Backdrop Style: Create a '{}' backdrop that complements \
                 the subject.",
                settings.studio_backdrop
            );
        }
    }

    out.push_str(
        "\n**FINAL INSTRUCTION:** Execute this multi-step process to transform the old \
         photograph into a perfect, modern, studio-quality portrait. The result must be \
         hyper-realistic and seamless.",
    );
    out
}

fn creative_workflow(
    settings: &CreativeSettings,
    prompt_hint: &str,
    mask: Option<MaskConvention>,
    has_reference: bool,
) -> String {
    let mut out = String::new();
    if let Some(convention) = mask {
        out.push_str(mask_preamble(convention));
    }

    if prompt_hint == STUDIO_SWAP {
        let _ = write!(
            out,
            "CRITICAL TASK: Perform a HYPER-REAL STUDIO SWAP. This involves two main stages: \
             generative matting for perfect subject isolation, followed by a seamless composite \
             into a new background.\n\n\
             **User's primary instruction:** \"Replace the background of the image with a new \
             one based on the following prompt, ensuring the result is indistinguishable from a \
             real studio photograph.\"\n\n---\n**WORKFLOW & PARAMETERS:**\n\n\
             **STAGE 1: HYPER-DETAIL GENERATIVE MATTING**\n\
             - **Action:** Isolate the primary subject from the original background.\n\
             - **Method: CRITICAL - Use Generative Matting.** Do NOT use a simple alpha mask. \
             Instead, analyze the boundary pixels (especially hair, fur, transparent fabrics) \
             and intelligently REGENERATE them. The goal is to preserve 100% of fine details \
             like individual hair strands, avoiding any 'halo' or matted-edge effects. The \
             isolated subject must be perfectly clean.\n\n\
             **STAGE 2: HYPER-REAL COMPOSITING**\n\
             - **New Background Prompt:** \"{}\"\n\
             - **Action:** Composite the perfectly isolated subject into the newly generated \
             background.\n\
             - **Compositing Method: CRITICAL - Use Hyper-Real Logic.** This is NOT a simple \
             layering. Execute the following in order:\n  \
             - **1. Environment Lighting Analysis:** Scan the new background to create a \
             virtual high-dynamic-range imaging (HDRI) map. Identify all light sources, their \
             direction, color temperature, and intensity (e.g., 'large softbox from top-right, \
             warm key light').\n  \
             - **2. Subject Re-lighting:** COMPLETELY REMOVE the original lighting from the \
             isolated subject. Then, use the virtual HDRI map to cast new, physically accurate \
             light onto the subject. The subject's lighting, highlights, and shadows MUST match \
             the new environment perfectly.\n  \
             - **3. Smart Shadow Casting:** Generate and cast a realistic shadow from the \
             subject onto the new background, based on the identified light sources. The shadow \
             should be soft or hard as dictated by the lighting.\n  \
             - **4. Full Harmonization:** Automatically match the subject's color temperature, \
             black levels, white balance, saturation, and film grain to the new background.\n  \
             - **5. Seam Blending:** Ensure the final integration is absolutely invisible.\n\n\
             **FINAL INSTRUCTION:** The final image must look like a single, cohesive \
             photograph taken in a professional setting. The composite should be completely \
             undetectable.",
            settings.background_prompt
        );
        return out;
    }

    if prompt_hint == FULL_BODY_GENERATION {
        let _ = write!(
            out,
            "CRITICAL TASK: Perform an 8K FULL-BODY GENERATION. This involves logically \
             extending the canvas and generating the missing parts of a character with \
             hyper-realistic detail.\n\n\
             **User's primary instruction:** \"Extend the character in the image based on the \
             following description. The result must be a complete, high-resolution \
             portrait.\"\n\n---\n**WORKFLOW & PARAMETERS:**\n\n\
             **STAGE 1: CORE IDENTITY PRESERVATION**\n\
             - **Identity-Lock: CRITICAL - 100% ENGAGED.** The subject's face, identity, and \
             all existing visible features MUST be preserved without any alteration.\n\n\
             **STAGE 2: 8K GENERATIVE EXTENSION**\n\
             - **Character Generation Prompt:** \"{prompt}\"\n\
             - **Action:** Generate the missing parts of the character (body, clothing, pose) \
             based on the user's prompt.\n\
             - **Generation Engine: CRITICAL - Use 8K Generative Engine.** The newly created \
             parts must not be a simple, low-detail fill. They must be rendered with extremely \
             high-frequency details.\n  \
             - **Fabric Texture:** Generate realistic micro-textures for clothing (e.g., weave \
             of a suit, knit of a sweater).\n  \
             - **Skin Detail:** If any new skin is visible, it must have realistic texture.\n  \
             - **Creases & Folds:** Clothing should have natural, physically-correct folds and \
             creases.\n\
             - **Lighting Synchronization:** The lighting on the newly generated parts (e.g., \
             the new suit) MUST perfectly and seamlessly match the existing lighting on the \
             original parts of the subject (e.g., the face). Analyze the original lighting and \
             apply it consistently across the entire figure.\n",
            prompt = settings.full_body_prompt
        );
        if has_reference {
            let _ = write!(
                out,
                "\n**STAGE 2.5: REFERENCE IMAGE INTEGRATION**\n\
                 - **Action:** A third image has been provided as a reference. Intelligently \
                 incorporate elements from this reference image into the generated parts of the \
                 character. This could be clothing, an object, or even another person to \
                 include. The integration must be seamless and contextually appropriate based \
                 on the user's prompt (\"{}\"). The reference image is a guide, not a strict \
                 composite element.\n",
                settings.full_body_prompt
            );
        }
        out.push_str(
            "\n**FINAL INSTRUCTION:** The output should be a single, cohesive, full-body \
             portrait where the generated parts are indistinguishable in quality and detail \
             from the original photograph. The entire subject should look sharp, clear, and \
             rendered in 8K resolution.",
        );
        return out;
    }

    let _ = write!(
        out,
        "This is a general creative request. Use the user's primary instruction \
         (\"{prompt_hint}\") as the main guide and creatively interpret the best outcome."
    );
    out
}

fn mask_preamble(convention: MaskConvention) -> &'static str {
    match convention {
        MaskConvention::Protect => {
            "CRITICAL TASK: INPAINTING/OUTPAINTING WITH A PROTECTED MASK. A second image is \
             provided which acts as a mask. The WHITE areas on this mask are PROTECTED and MUST \
             NOT BE ALTERED in any way. The BLACK areas are where new content should be \
             generated.\n\n**ABSOLUTE RULE: Preserve the white masked areas of the original \
             image with 100% fidelity.**\n\n---\n"
        }
        MaskConvention::Erase => {
            "CRITICAL TASK: INPAINTING/OUTPAINTING WITH AN ERASE MASK. A second image is \
             provided which acts as a mask. The TRANSPARENT areas on this mask are where new \
             content should be generated. The OPAQUE areas are PROTECTED and MUST NOT BE \
             ALTERED in any way.\n\n**ABSOLUTE RULE: Preserve the opaque masked areas of the \
             original image with 100% fidelity.**\n\n---\n"
        }
    }
}

fn composite_workflow(settings: &CompositeSettings, prompt_hint: &str) -> String {
    let instruction = if prompt_hint.is_empty() {
        "Perform the edit based on the parameters below."
    } else {
        prompt_hint
    };
    let mut out = format!(
        "Task: Perform an image editing operation based on the user's request.\n\
         Mode: \"Composite\"\n\n\
         User's primary instruction: \"{instruction}\"\n\n\
         Apply the following style and technical parameters:\n"
    );

    // Generic parameter listing: one line per non-empty field, engine
    // selection excluded. Alphabetical by field name, so output is stable.
    let fields = serde_json::to_value(settings)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default();
    for (key, value) in &fields {
        if key == "provider" || key == "model" {
            continue;
        }
        if matches!(value, serde_json::Value::String(text) if text.is_empty()) {
            continue;
        }
        let _ = writeln!(out, "- {key}: {value}");
    }

    let _ = write!(
        out,
        "\nInstructions for Composite Mode:\n\
         - The first image provided is the SUBJECT.\n\
         - The second image provided is the new BACKGROUND.\n\
         - Seamlessly integrate the subject into the background.\n\
         - Pay close attention to matching lighting, color temperature, shadows, grain, focus, \
         and perspective to create a photorealistic composite.\n\
         - The user's prompt (\"{prompt_hint}\") provides additional context for the final \
         scene."
    );
    out
}

fn compile_condensed(settings: &ModeSettings, prompt_hint: &str) -> String {
    let base = if !prompt_hint.is_empty()
        && prompt_hint != INSTANT_STUDIO_REMASTER
        && prompt_hint != STUDIO_SWAP
        && prompt_hint != FULL_BODY_GENERATION
    {
        prompt_hint.to_string()
    } else {
        match settings {
            ModeSettings::Portrait(portrait) => {
                let mut base = "A studio portrait of a person.".to_string();
                if !portrait.makeup.is_empty() {
                    let _ = write!(base, " With {} makeup.", portrait.makeup);
                }
                if !portrait.hair.is_empty() {
                    let _ = write!(base, " With {} hair.", portrait.hair);
                }
                base
            }
            ModeSettings::Restore(restore) => format!(
                "A restored, clear, high-resolution photograph. {}",
                restore.context
            )
            .trim_end()
            .to_string(),
            ModeSettings::Creative(creative) => {
                if !creative.full_body_prompt.is_empty() {
                    creative.full_body_prompt.clone()
                } else if !creative.background_prompt.is_empty() {
                    creative.background_prompt.clone()
                } else {
                    "A highly creative, detailed image.".to_string()
                }
            }
            ModeSettings::Composite(_) => "A realistic composite image.".to_string(),
        }
    };
    format!("{base}, 8k, photorealistic, high detail")
}

#[cfg(test)]
mod tests {
    use atelier_contracts::modes::WorkMode;

    use super::*;

    #[test]
    fn compile_is_deterministic_for_identical_inputs() {
        for mode in WorkMode::all() {
            let settings = ModeSettings::defaults(mode);
            for provider in Provider::all() {
                let a = compile(provider, &settings, "fix the lighting", None, false);
                let b = compile(provider, &settings, "fix the lighting", None, false);
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn portrait_sentinel_selects_remaster_workflow() {
        let settings = ModeSettings::defaults(WorkMode::Portrait);
        let remaster = compile(
            Provider::Gemini,
            &settings,
            INSTANT_STUDIO_REMASTER,
            None,
            false,
        );
        assert!(remaster.contains("INSTANT STUDIO REMASTER"));

        let custom = compile(Provider::Gemini, &settings, "soften the shadows", None, false);
        assert!(custom.contains("custom studio-quality portrait enhancement"));
        assert!(custom.contains("\"soften the shadows\""));
    }

    #[test]
    fn portrait_toggles_swap_between_engaged_and_disengaged_wording() {
        let ModeSettings::Portrait(mut portrait) =
            ModeSettings::defaults(WorkMode::Portrait)
        else {
            unreachable!();
        };
        portrait.auto_balance_lighting = true;
        let on = compile(
            Provider::Gemini,
            &ModeSettings::Portrait(portrait.clone()),
            "",
            None,
            false,
        );
        assert!(on.contains("**Auto-Relighting:** ENGAGED"));

        portrait.auto_balance_lighting = false;
        let off = compile(
            Provider::Gemini,
            &ModeSettings::Portrait(portrait),
            "",
            None,
            false,
        );
        assert!(off.contains("**Auto-Relighting:** DISENGAGED"));
        assert!(!off.contains("**Auto-Relighting:** ENGAGED"));
    }

    #[test]
    fn cosmetic_fields_are_omitted_when_empty() {
        let ModeSettings::Portrait(mut portrait) =
            ModeSettings::defaults(WorkMode::Portrait)
        else {
            unreachable!();
        };
        portrait.makeup.clear();
        let without = compile(
            Provider::Gemini,
            &ModeSettings::Portrait(portrait.clone()),
            "",
            None,
            false,
        );
        assert!(!without.contains("Makeup Style"));

        portrait.makeup = "soft glam".to_string();
        let with = compile(Provider::Gemini, &ModeSettings::Portrait(portrait), "", None, false);
        assert!(with.contains("**Makeup Style:** Apply makeup as described: \"soft glam\"."));
    }

    #[test]
    fn restore_background_branch_follows_processing_choice() {
        let ModeSettings::Restore(mut restore) = ModeSettings::defaults(WorkMode::Restore)
        else {
            unreachable!();
        };
        restore.background_processing = BackgroundProcessing::Remaster;
        let remaster = compile(
            Provider::Gemini,
            &ModeSettings::Restore(restore.clone()),
            "",
            None,
            false,
        );
        assert!(remaster.contains("Remaster the original background"));

        restore.background_processing = BackgroundProcessing::NewStudio;
        let swap = compile(Provider::Gemini, &ModeSettings::Restore(restore), "", None, false);
        assert!(swap.contains("new, clean studio backdrop"));
        assert!(swap.contains("'grey' backdrop"));
    }

    #[test]
    fn creative_mask_preamble_states_polarity_explicitly() {
        let settings = ModeSettings::defaults(WorkMode::Creative);
        let protect = compile(
            Provider::Gemini,
            &settings,
            "add a castle",
            Some(MaskConvention::Protect),
            false,
        );
        assert!(protect.starts_with("CRITICAL TASK: INPAINTING/OUTPAINTING WITH A PROTECTED MASK"));
        assert!(protect.contains("WHITE areas on this mask are PROTECTED"));

        let erase = compile(
            Provider::Gemini,
            &settings,
            "add a castle",
            Some(MaskConvention::Erase),
            false,
        );
        assert!(erase.contains("TRANSPARENT areas on this mask are where new content"));

        let unmasked = compile(Provider::Gemini, &settings, "add a castle", None, false);
        assert!(!unmasked.contains("INPAINTING/OUTPAINTING"));
    }

    #[test]
    fn full_body_workflow_gates_reference_block_on_attachment() {
        let ModeSettings::Creative(mut creative) =
            ModeSettings::defaults(WorkMode::Creative)
        else {
            unreachable!();
        };
        creative.full_body_prompt = "a navy suit".to_string();
        let settings = ModeSettings::Creative(creative);

        let without = compile(Provider::Gemini, &settings, FULL_BODY_GENERATION, None, false);
        assert!(!without.contains("REFERENCE IMAGE INTEGRATION"));

        let with = compile(Provider::Gemini, &settings, FULL_BODY_GENERATION, None, true);
        assert!(with.contains("STAGE 2.5: REFERENCE IMAGE INTEGRATION"));
        assert!(with.contains("\"a navy suit\""));
    }

    #[test]
    fn composite_lists_parameters_and_skips_engine_fields() {
        let settings = ModeSettings::defaults(WorkMode::Composite);
        let text = compile(Provider::Gemini, &settings, "beach at dusk", None, false);
        assert!(text.contains("- light_match: 85"));
        assert!(text.contains("- smart_shadows: true"));
        assert!(!text.contains("- provider"));
        assert!(!text.contains("- model"));
        assert!(text.contains("The second image provided is the new BACKGROUND."));
        assert!(text.contains("(\"beach at dusk\")"));
    }

    #[test]
    fn condensed_rendering_appends_quality_suffix() {
        let settings = ModeSettings::defaults(WorkMode::Portrait);
        let text = compile(Provider::OpenAi, &settings, "an astronaut at dawn", None, false);
        assert_eq!(text, "an astronaut at dawn, 8k, photorealistic, high detail");
    }

    #[test]
    fn condensed_rendering_falls_back_per_mode_when_hint_absent() {
        let portrait = compile(
            Provider::OpenAi,
            &ModeSettings::defaults(WorkMode::Portrait),
            "",
            None,
            false,
        );
        assert!(portrait.starts_with("A studio portrait of a person."));

        let ModeSettings::Creative(mut creative) =
            ModeSettings::defaults(WorkMode::Creative)
        else {
            unreachable!();
        };
        creative.background_prompt = "misty forest".to_string();
        let condensed = compile(
            Provider::OpenAi,
            &ModeSettings::Creative(creative),
            STUDIO_SWAP,
            None,
            false,
        );
        assert_eq!(condensed, "misty forest, 8k, photorealistic, high detail");
    }
}
