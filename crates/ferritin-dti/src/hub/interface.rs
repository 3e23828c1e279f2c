use super::dictionary::{Dictionary, BOS, EOS, MASK, UNK};
use crate::dti::{Branch, DtiInput, DtiModel, DtiOutput, ForwardArgs, FusionParams, KnnEmbeddings};
use crate::error::{DtiError, Result};
use crate::types::{ClassScore, FilledMask};
use candle_core::{IndexOp, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use itertools::Itertools;

/// Tokenizes molecule and protein text and runs the DTI model on it.
///
/// Both inputs are expected to be pre-tokenized, whitespace separated
/// symbols of the respective dictionary.
pub struct DtiHubInterface {
    model: DtiModel,
    molecule_dict: Dictionary,
    protein_dict: Dictionary,
}

impl DtiHubInterface {
    pub fn new(model: DtiModel, molecule_dict: Dictionary, protein_dict: Dictionary) -> Self {
        Self {
            model,
            molecule_dict,
            protein_dict,
        }
    }

    pub fn dictionary(&self, branch: Branch) -> &Dictionary {
        match branch {
            Branch::Molecule => &self.molecule_dict,
            Branch::Protein => &self.protein_dict,
        }
    }

    fn encode_ids(&self, branch: Branch, text: &str) -> Vec<u32> {
        self.dictionary(branch)
            .encode_line(&format!("{BOS} {text} {EOS}"))
    }

    /// `<s> text </s>` as a 1-D tensor of indices.
    pub fn encode(&self, branch: Branch, text: &str) -> Result<Tensor> {
        let ids = self.encode_ids(branch, text);
        Ok(Tensor::new(ids.as_slice(), self.model.device())?)
    }

    pub fn encode_molecule(&self, molecule: &str) -> Result<Tensor> {
        self.encode(Branch::Molecule, molecule)
    }

    pub fn encode_protein(&self, protein: &str) -> Result<Tensor> {
        self.encode(Branch::Protein, protein)
    }

    pub fn encode_pair(&self, molecule: &str, protein: &str) -> Result<(Tensor, Tensor)> {
        Ok((self.encode_molecule(molecule)?, self.encode_protein(protein)?))
    }

    /// Encodes each pair and right-pads every side to its longest sequence.
    pub fn encode_pair_batch(
        &self,
        molecules: &[&str],
        proteins: &[&str],
    ) -> Result<(Tensor, Tensor)> {
        if molecules.len() != proteins.len() {
            return Err(DtiError::Input(format!(
                "got {} molecules but {} proteins",
                molecules.len(),
                proteins.len()
            )));
        }
        if molecules.is_empty() {
            return Err(DtiError::Input("cannot encode an empty batch".to_string()));
        }
        Ok((
            self.padded_batch(Branch::Molecule, molecules)?,
            self.padded_batch(Branch::Protein, proteins)?,
        ))
    }

    fn padded_batch(&self, branch: Branch, texts: &[&str]) -> Result<Tensor> {
        let pad = self.dictionary(branch).pad();
        let encoded: Vec<Vec<u32>> = texts.iter().map(|t| self.encode_ids(branch, t)).collect();
        let max_len = encoded.iter().map(|ids| ids.len()).max().unwrap_or(0);
        let flat: Vec<u32> = encoded
            .into_iter()
            .flat_map(|mut ids| {
                ids.resize(max_len, pad);
                ids
            })
            .collect();
        Ok(Tensor::from_vec(
            flat,
            (texts.len(), max_len),
            self.model.device(),
        )?)
    }

    /// Symbols of a 1-D token tensor, one string per document.
    ///
    /// A leading `<s>` is dropped and documents are separated by two
    /// consecutive `</s>`.
    pub fn decode(&self, branch: Branch, tokens: &Tensor) -> Result<Vec<String>> {
        if tokens.rank() != 1 {
            return Err(DtiError::Input(format!(
                "decode expects a 1-D token tensor, got {:?}",
                tokens.dims()
            )));
        }
        let dict = self.dictionary(branch);
        let tokens = tokens.to_dtype(candle_core::DType::U32)?.to_vec1::<u32>()?;
        let tokens = match tokens.first() {
            Some(&first) if first == dict.bos() => &tokens[1..],
            _ => &tokens[..],
        };
        let eos = dict.eos();
        let mut documents = Vec::new();
        let mut start = 0;
        for (i, pair) in tokens.windows(2).enumerate() {
            if pair[0] == eos && pair[1] == eos {
                documents.push(dict.string(&tokens[start..=i]));
                start = i + 1;
            }
        }
        documents.push(dict.string(&tokens[start..]));
        Ok(documents)
    }

    fn batched(tokens: &Tensor) -> Result<Tensor> {
        Ok(if tokens.rank() == 1 {
            tokens.unsqueeze(0)?
        } else {
            tokens.clone()
        })
    }

    fn batched_knn(knn: KnnEmbeddings) -> Result<KnnEmbeddings> {
        Ok(KnnEmbeddings {
            molecule: knn.molecule.as_ref().map(Self::batched).transpose()?,
            protein: knn.protein.as_ref().map(Self::batched).transpose()?,
        })
    }

    /// Last-layer features of one branch, or every inner state when
    /// `return_all_hiddens` is set. Each is `[batch, seq_len, embed_dim]`.
    pub fn extract_branch_features(
        &self,
        branch: Branch,
        tokens: &Tensor,
        return_all_hiddens: bool,
    ) -> Result<Vec<Tensor>> {
        let tokens = Self::batched(tokens)?;
        let output = self
            .model
            .encoder(branch)
            .forward(&tokens, true, return_all_hiddens, false)?;
        Ok(match output.inner_states {
            Some(states) if return_all_hiddens => states,
            _ => vec![output.features],
        })
    }

    /// Pooled pair embeddings without classification.
    pub fn extract_features(
        &self,
        molecule: &Tensor,
        protein: &Tensor,
        knn: KnnEmbeddings,
        fusion: FusionParams,
    ) -> Result<DtiOutput> {
        self.run(molecule, protein, knn, fusion, None)
    }

    fn run(
        &self,
        molecule: &Tensor,
        protein: &Tensor,
        knn: KnnEmbeddings,
        fusion: FusionParams,
        head: Option<&str>,
    ) -> Result<DtiOutput> {
        let mut args = ForwardArgs::new(DtiInput::Tokens {
            molecule: Self::batched(molecule)?,
            protein: Self::batched(protein)?,
        })
        .with_knn(Self::batched_knn(knn)?)
        .with_fusion(fusion);
        args.head = head;
        self.model.forward(args)
    }

    /// Raw head logits, `[batch, num_classes]`.
    pub fn predict_logits(
        &self,
        head: &str,
        molecule: &Tensor,
        protein: &Tensor,
        knn: KnnEmbeddings,
        fusion: FusionParams,
    ) -> Result<Tensor> {
        self.run(molecule, protein, knn, fusion, Some(head))?
            .logits
            .ok_or_else(|| DtiError::HeadNotFound(head.to_string()))
    }

    /// Log-probabilities over the head's classes, `[batch, num_classes]`.
    pub fn predict(
        &self,
        head: &str,
        molecule: &Tensor,
        protein: &Tensor,
        knn: KnnEmbeddings,
        fusion: FusionParams,
    ) -> Result<Tensor> {
        let logits = self.predict_logits(head, molecule, protein, knn, fusion)?;
        Ok(log_softmax(&logits, D::Minus1)?)
    }

    /// The most likely class per pair.
    pub fn classify(
        &self,
        head: &str,
        molecule: &Tensor,
        protein: &Tensor,
        knn: KnnEmbeddings,
        fusion: FusionParams,
    ) -> Result<Vec<ClassScore>> {
        let log_probs = self
            .predict(head, molecule, protein, knn, fusion)?
            .to_vec2::<f32>()?;
        Ok(log_probs
            .iter()
            .filter_map(|row| {
                row.iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(class, log_prob)| ClassScore { class, log_prob })
            })
            .collect())
    }

    /// Top-`topk` symbols for the single `<mask>` in `masked_input`.
    pub fn fill_mask(
        &self,
        branch: Branch,
        masked_input: &str,
        topk: usize,
    ) -> Result<Vec<FilledMask>> {
        if masked_input.matches(MASK).count() != 1 {
            return Err(DtiError::Input(format!(
                "please add one {MASK} token for the input, eg: 'C C {MASK} O'"
            )));
        }
        let dict = self.dictionary(branch);
        let mask = dict
            .mask()
            .ok_or_else(|| DtiError::Input(format!("{branch} dictionary has no {MASK} symbol")))?;
        let text = masked_input
            .split(MASK)
            .map(|span| span.trim_end())
            .join(&format!(" {MASK} "));
        let ids = self.encode_ids(branch, text.trim());
        let masked_index = ids
            .iter()
            .position(|&t| t == mask)
            .ok_or_else(|| DtiError::Input(format!("no {MASK} left after encoding")))?;

        let tokens = Tensor::new(ids.as_slice(), self.model.device())?.unsqueeze(0)?;
        let output = self
            .model
            .encoder(branch)
            .forward(&tokens, false, false, false)?;
        let logits = output
            .logits
            .ok_or_else(|| DtiError::Input("encoder returned no vocabulary logits".to_string()))?;
        let probs = softmax(&logits.i((0, masked_index))?, 0)?.to_vec1::<f32>()?;

        Ok(probs
            .iter()
            .copied()
            .enumerate()
            .sorted_by(|a, b| b.1.total_cmp(&a.1))
            .take(topk)
            .map(|(idx, score)| {
                let token = dict.symbol(idx as u32).unwrap_or(UNK).to_string();
                FilledMask {
                    sequence: masked_input.replacen(MASK, &token, 1),
                    score,
                    token,
                }
            })
            .collect())
    }

    pub fn register_classification_head(
        &mut self,
        name: &str,
        num_classes: usize,
        inner_dim: Option<usize>,
    ) -> Result<()> {
        self.model
            .register_classification_head(name, num_classes, inner_dim)
    }

    pub fn model(&self) -> &DtiModel {
        &self.model
    }
    pub fn model_mut(&mut self) -> &mut DtiModel {
        &mut self.model
    }
}
