mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::{max_abs_diff, random_model, tiny_config, CapturedLogs, EMBED_DIM, HEAD, MAX_POSITIONS};
use ferritin_dti::dti::fusion::knn_blend;
use ferritin_dti::{
    Branch, DtiConfig, DtiError, ForwardArgs, FusionParams, KnnEmbeddings, KnnMode,
};

fn molecule_tokens(dev: &Device) -> Result<Tensor> {
    // <s> C C ( = O ) O </s>, second row padded
    Ok(Tensor::new(
        &[[0u32, 4, 4, 6, 10, 8, 7, 8, 2], [0, 4, 8, 2, 1, 1, 1, 1, 1]],
        dev,
    )?)
}

fn protein_tokens(dev: &Device) -> Result<Tensor> {
    Ok(Tensor::new(
        &[[0u32, 20, 11, 14, 5, 2, 1], [0, 4, 5, 6, 7, 8, 2]],
        dev,
    )?)
}

#[test]
fn test_forward_shapes_with_head() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 2, None)?;

    let out = model.forward(
        ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?).with_head(HEAD),
    )?;
    let logits = out.logits.expect("head was requested");
    assert_eq!(logits.dims2()?, (2, 2));
    assert_eq!(out.molecule.dims2()?, (2, EMBED_DIM));
    assert_eq!(out.protein.expect("pair input").dims2()?, (2, EMBED_DIM));
    Ok(())
}

#[test]
fn test_forward_without_head_returns_embeddings() -> Result<()> {
    let dev = Device::Cpu;
    let model = random_model(&tiny_config())?;
    let out = model.forward(ForwardArgs::tokens(
        molecule_tokens(&dev)?,
        protein_tokens(&dev)?,
    ))?;
    assert!(out.logits.is_none());
    assert_eq!(out.molecule.dims2()?, (2, EMBED_DIM));
    Ok(())
}

#[test]
fn test_unknown_head() -> Result<()> {
    let dev = Device::Cpu;
    let model = random_model(&tiny_config())?;
    let err = model
        .forward(
            ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?)
                .with_head("missing"),
        )
        .unwrap_err();
    assert!(matches!(err, DtiError::HeadNotFound(name) if name == "missing"));
    Ok(())
}

#[test]
fn test_sequence_too_long_per_branch() -> Result<()> {
    let dev = Device::Cpu;
    let model = random_model(&tiny_config())?;
    let long = Tensor::full(4u32, (1, MAX_POSITIONS + 1), &dev)?;
    let short = Tensor::new(&[[0u32, 4, 2]], &dev)?;

    let err = model
        .forward(ForwardArgs::tokens(long.clone(), short.clone()))
        .unwrap_err();
    assert!(matches!(
        err,
        DtiError::SequenceTooLong { branch: Branch::Molecule, len, max } if len == 65 && max == 64
    ));
    assert_eq!(
        err.to_string(),
        "molecule tokens exceed maximum length: 65 > 64"
    );

    let err = model.forward(ForwardArgs::tokens(short, long)).unwrap_err();
    assert!(matches!(
        err,
        DtiError::SequenceTooLong {
            branch: Branch::Protein,
            ..
        }
    ));

    // exactly at the limit is fine
    let edge = Tensor::full(4u32, (1, MAX_POSITIONS), &dev)?;
    assert!(model.forward(ForwardArgs::molecule_only(edge)).is_ok());
    Ok(())
}

#[test]
fn test_empty_tokens_rejected_per_branch() -> Result<()> {
    let dev = Device::Cpu;
    let model = random_model(&tiny_config())?;
    let empty = Tensor::zeros((1, 0), DType::U32, &dev)?;
    let short = Tensor::new(&[[0u32, 4, 2]], &dev)?;

    let err = model
        .forward(ForwardArgs::tokens(empty.clone(), short.clone()))
        .unwrap_err();
    assert!(matches!(&err, DtiError::Input(msg) if msg.starts_with("molecule")));

    let err = model
        .forward(ForwardArgs::tokens(short, empty.clone()))
        .unwrap_err();
    assert!(matches!(&err, DtiError::Input(msg) if msg.starts_with("protein")));

    let err = model.forward(ForwardArgs::molecule_only(empty)).unwrap_err();
    assert!(matches!(&err, DtiError::Input(msg) if msg.starts_with("molecule")));
    Ok(())
}

#[test]
fn test_padding_only_row_rejected() -> Result<()> {
    let dev = Device::Cpu;
    let model = random_model(&tiny_config())?;
    let padded = Tensor::new(&[[0u32, 4, 2], [1, 1, 1]], &dev)?;
    let pair = Tensor::new(&[[0u32, 4, 2], [0, 5, 2]], &dev)?;

    let err = model
        .forward(ForwardArgs::tokens(padded.clone(), pair.clone()))
        .unwrap_err();
    assert!(matches!(&err, DtiError::Input(msg) if msg.contains("only of padding")));

    let err = model
        .forward(ForwardArgs::tokens(pair, padded.clone()))
        .unwrap_err();
    assert!(matches!(&err, DtiError::Input(msg) if msg.starts_with("protein")));

    assert!(matches!(
        model.forward(ForwardArgs::molecule_only(padded)),
        Err(DtiError::Input(_))
    ));
    Ok(())
}

#[test]
fn test_molecule_only() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 2, None)?;
    let out = model.forward(ForwardArgs::molecule_only(molecule_tokens(&dev)?))?;
    assert!(out.logits.is_none());
    assert!(out.protein.is_none());
    assert_eq!(out.molecule.dims2()?, (2, EMBED_DIM));

    let pooled = model
        .encoder(Branch::Molecule)
        .pooled(&molecule_tokens(&dev)?, false)?;
    assert!(max_abs_diff(&out.molecule, &pooled)? < 1e-6);

    // head, neighbours and fusion mode are all ignored
    let knn = KnnEmbeddings::new(
        Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?,
        Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?,
    );
    let flagged = model.forward(
        ForwardArgs::molecule_only(molecule_tokens(&dev)?)
            .with_head(HEAD)
            .with_knn(knn)
            .with_fusion(FusionParams::with_mode(KnnMode::MolPro)),
    )?;
    assert!(flagged.logits.is_none());
    assert!(flagged.protein.is_none());
    assert!(max_abs_diff(&flagged.molecule, &pooled)? < 1e-6);
    Ok(())
}

#[test]
fn test_single_branch_modes_leave_head_input_unchanged() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 3, None)?;
    let knn = KnnEmbeddings::new(
        Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?,
        Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?,
    );

    let plain = model.forward(
        ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?).with_head(HEAD),
    )?;
    for mode in [KnnMode::Mol, KnnMode::Pro] {
        let out = model.forward(
            ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?)
                .with_head(HEAD)
                .with_knn(knn.clone())
                .with_fusion(FusionParams::with_mode(mode)),
        )?;
        let diff = max_abs_diff(
            out.logits.as_ref().expect("logits"),
            plain.logits.as_ref().expect("logits"),
        )?;
        assert!(diff < 1e-6, "{mode} changed the head input");
    }
    Ok(())
}

#[test]
fn test_mol_pro_blends_both_branches() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 2, None)?;
    let knn_0 = Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?;
    let knn_1 = Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?;
    let fusion = FusionParams::with_mode(KnnMode::MolPro);

    let out = model.forward(
        ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?)
            .with_head(HEAD)
            .with_knn(KnnEmbeddings::new(knn_0.clone(), knn_1.clone()))
            .with_fusion(fusion),
    )?;

    // token input returns the raw pooled embeddings
    let x_0 = out.molecule.clone();
    let x_1 = out.protein.clone().expect("pair input");
    let fused = Tensor::cat(
        &[
            &knn_blend(&x_0, Some(&knn_0), 0.8, 0.707)?,
            &knn_blend(&x_1, Some(&knn_1), 0.8, 0.707)?,
        ],
        1,
    )?;
    let expected = model.classification_head(HEAD)?.forward(&fused, false)?;
    assert!(max_abs_diff(&out.logits.expect("logits"), &expected)? < 1e-5);
    Ok(())
}

#[test]
fn test_pooled_input_without_mol_pro_feeds_protein_twice() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 2, None)?;
    let cls_0 = Tensor::randn(0f32, 1f32, (3, EMBED_DIM), &dev)?;
    let cls_1 = Tensor::randn(0f32, 1f32, (3, EMBED_DIM), &dev)?;

    let out = model.forward(ForwardArgs::pooled(cls_0.clone(), cls_1.clone()).with_head(HEAD))?;

    let doubled = Tensor::cat(&[&cls_1, &cls_1], 1)?;
    let expected = model.classification_head(HEAD)?.forward(&doubled, false)?;
    assert!(max_abs_diff(out.logits.as_ref().expect("logits"), &expected)? < 1e-6);

    // returned values are the blends, with a missing neighbour contributing nothing
    let blended_0 = (&cls_0 * (0.707 * 0.8))?;
    assert!(max_abs_diff(&out.molecule, &blended_0)? < 1e-5);
    Ok(())
}

#[test]
fn test_pooled_input_with_mol_pro() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 2, None)?;
    let cls_0 = Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?;
    let cls_1 = Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?;
    let knn_0 = Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?;
    let knn_1 = Tensor::randn(0f32, 1f32, (2, EMBED_DIM), &dev)?;
    let fusion = FusionParams {
        mode: KnnMode::MolPro,
        molecule_weight: 0.6,
        protein_weight: 0.9,
        alpha: 1.0,
    };

    let out = model.forward(
        ForwardArgs::pooled(cls_0.clone(), cls_1.clone())
            .with_head(HEAD)
            .with_knn(KnnEmbeddings::new(knn_0.clone(), knn_1.clone()))
            .with_fusion(fusion),
    )?;
    let fused_0 = ((&cls_0 * 0.6)? + (&knn_0 * 0.4)?)?;
    let fused_1 = ((&cls_1 * 0.9)? + (&knn_1 * 0.1)?)?;
    assert!(max_abs_diff(&out.molecule, &fused_0)? < 1e-5);
    assert!(max_abs_diff(out.protein.as_ref().expect("protein"), &fused_1)? < 1e-5);

    let expected = model
        .classification_head(HEAD)?
        .forward(&Tensor::cat(&[&fused_0, &fused_1], 1)?, false)?;
    assert!(max_abs_diff(&out.logits.expect("logits"), &expected)? < 1e-5);
    Ok(())
}

#[test]
fn test_pooled_input_width_is_checked() -> Result<()> {
    let dev = Device::Cpu;
    let model = random_model(&tiny_config())?;
    let wrong = Tensor::zeros((2, EMBED_DIM + 1), DType::F32, &dev)?;
    let right = Tensor::zeros((2, EMBED_DIM), DType::F32, &dev)?;
    assert!(matches!(
        model.forward(ForwardArgs::pooled(wrong, right)),
        Err(DtiError::Input(_))
    ));
    Ok(())
}

#[test]
fn test_reregistering_head_replaces_and_warns() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = random_model(&tiny_config())?;
    let logs = CapturedLogs::default();

    logs.capture(|| -> Result<()> {
        model.register_classification_head(HEAD, 2, None)?;
        model.register_classification_head(HEAD, 2, None)?;
        Ok(())
    })?;
    assert!(!logs.contents().contains("re-registering head"));

    logs.capture(|| model.register_classification_head(HEAD, 5, Some(8)))?;
    let contents = logs.contents();
    assert!(contents.contains("WARN"));
    assert!(contents.contains("re-registering head \"sentence_classification_head\""));
    assert!(contents.contains("num_classes 5 (prev: 2)"));

    assert_eq!(model.head_names(), vec![HEAD]);
    let out = model.forward(
        ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?).with_head(HEAD),
    )?;
    assert_eq!(out.logits.expect("logits").dims2()?, (2, 5));
    Ok(())
}

#[test]
fn test_frozen_lower_layers_are_not_trainable() -> Result<()> {
    let mut model = random_model(&tiny_config())?;
    model.register_classification_head(HEAD, 2, None)?;

    let encoder = model.encoder(Branch::Molecule);
    let frozen = encoder.frozen_parameter_names()?;
    // token/position embeddings, embedding layer norm and both layers
    assert_eq!(frozen.len(), 1 + 1 + 2 + 2 * 16);
    assert!(frozen.iter().all(|n| n.starts_with("sentence_encoder.")));
    // only the LM head of each encoder plus the classification head remain
    assert_eq!(model.trainable_vars()?.len(), 2 * 5 + 4);

    let unfrozen = DtiConfig {
        freeze_lower_layers: false,
        ..tiny_config()
    };
    let mut model = random_model(&unfrozen)?;
    model.register_classification_head(HEAD, 2, None)?;
    assert!(model
        .encoder(Branch::Protein)
        .frozen_parameter_names()?
        .is_empty());
    assert_eq!(model.trainable_vars()?.len(), 2 * 41 + 4);
    Ok(())
}

#[test]
fn test_train_mode_with_dropout_still_shapes() -> Result<()> {
    let dev = Device::Cpu;
    let config = DtiConfig {
        encoder_layerdrop: 0.5,
        pooler_dropout: 0.2,
        ..tiny_config()
    };
    let mut model = random_model(&config)?;
    model.register_classification_head(HEAD, 2, None)?;
    let out = model.forward(
        ForwardArgs::tokens(molecule_tokens(&dev)?, protein_tokens(&dev)?)
            .with_head(HEAD)
            .with_train(true),
    )?;
    assert_eq!(out.logits.expect("logits").dims2()?, (2, 2));
    Ok(())
}
