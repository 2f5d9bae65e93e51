//! Dependency corpus loading
//!
//! Reads CoNLL-U files with the `conllu` reader into parallel per-sentence
//! fields (tokens, lemmas, POS tags, relations, roots). Only FORM, LEMMA,
//! UPOS, and the dependency head of each word are kept.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use udgraph::graph::Sentence;
use conllu::io::{ReadSentence, Reader};

const PUNCT_TAG: &str = "PUNCT";

/// A `(dependent_id, head_id)` pair; ids are 1-based and head 0 is the root
pub type Relation = (usize, usize);

/// Sentences of one dependency-annotated file
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    source: String,
    tokens: Vec<Vec<String>>,
    lemmas: Vec<Vec<String>>,
    pos: Vec<Vec<String>>,
    relations: Vec<Vec<Relation>>,
    roots: Vec<Vec<usize>>,
}

impl Corpus {
    /// Load a CoNLL-U file
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open corpus {}", path.display()))?;
        Self::read(BufReader::new(file), &path.display().to_string())
    }

    /// Parse CoNLL-U text; `source` names the input in diagnostics
    pub fn parse(content: &str, source: &str) -> Result<Self> {
        Self::read(content.as_bytes(), source)
    }

    fn read<R: BufRead>(input: R, source: &str) -> Result<Self> {
        let mut corpus = Self {
            source: source.to_string(),
            ..Self::default()
        };
        let mut reader = Reader::new(input);
        while let Some(sentence) = reader
            .read_sentence()
            .with_context(|| format!("{source}: invalid CoNLL-U after sentence {}", corpus.len()))?
        {
            corpus
                .push_sentence(&sentence)
                .with_context(|| format!("{source}: sentence {}", corpus.len() + 1))?;
        }
        Ok(corpus)
    }

    /// Append one parsed sentence; sentences without words are skipped
    fn push_sentence(&mut self, sentence: &Sentence) -> Result<()> {
        let graph = sentence.dep_graph();
        let mut tokens = Vec::new();
        let mut lemmas = Vec::new();
        let mut pos = Vec::new();
        let mut relations = Vec::new();
        let mut roots = Vec::new();

        // Node 0 is the artificial root
        for dep in 1..sentence.len() {
            let token = sentence[dep]
                .token()
                .with_context(|| format!("node {dep} is not a word"))?;
            let head = graph
                .head(dep)
                .with_context(|| format!("word {dep} ({}) has no head", token.form()))?
                .head();

            relations.push((dep, head));
            if head == 0 {
                roots.push(dep);
            }
            tokens.push(token.form().to_string());
            lemmas.push(token.lemma().unwrap_or("_").to_string());
            pos.push(token.upos().unwrap_or("_").to_string());
        }

        if relations.is_empty() {
            return Ok(());
        }
        self.tokens.push(tokens);
        self.lemmas.push(lemmas);
        self.pos.push(pos);
        self.relations.push(relations);
        self.roots.push(roots);
        Ok(())
    }

    /// Build a new corpus without the given sentence indices.
    ///
    /// Every parallel field is filtered with the same index set, so no field
    /// can drift out of step with another.
    pub fn without(&self, indices: &BTreeSet<usize>) -> Self {
        fn keep<T: Clone>(values: &[T], indices: &BTreeSet<usize>) -> Vec<T> {
            values
                .iter()
                .enumerate()
                .filter(|(i, _)| !indices.contains(i))
                .map(|(_, v)| v.clone())
                .collect()
        }

        Self {
            source: self.source.clone(),
            tokens: keep(&self.tokens, indices),
            lemmas: keep(&self.lemmas, indices),
            pos: keep(&self.pos, indices),
            relations: keep(&self.relations, indices),
            roots: keep(&self.roots, indices),
        }
    }

    /// Name of the file this corpus was read from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn tokens(&self) -> &[Vec<String>] {
        &self.tokens
    }

    pub fn lemmas(&self) -> &[Vec<String>] {
        &self.lemmas
    }

    pub fn pos(&self) -> &[Vec<String>] {
        &self.pos
    }

    pub fn relations(&self) -> &[Vec<Relation>] {
        &self.relations
    }

    pub fn roots(&self) -> &[Vec<usize>] {
        &self.roots
    }

    /// Number of words per sentence
    pub fn word_count(&self) -> Vec<usize> {
        self.relations.iter().map(Vec::len).collect()
    }

    /// Dependent → head map per sentence
    pub fn unlabeled_relations(&self) -> Vec<HashMap<usize, usize>> {
        self.relations
            .iter()
            .map(|sent| sent.iter().copied().collect())
            .collect()
    }

    /// `true` for every word that is not punctuation
    pub fn punctuation_mask(&self) -> Vec<Vec<bool>> {
        self.pos
            .iter()
            .map(|sent| sent.iter().map(|tag| tag != PUNCT_TAG).collect())
            .collect()
    }

    /// Undirected edges whose dependent is not punctuation and whose head is not the root
    pub fn unlabeled_unordered_relations(&self) -> Vec<HashSet<(usize, usize)>> {
        self.relations
            .iter()
            .zip(self.punctuation_mask())
            .map(|(sent, mask)| {
                sent.iter()
                    .filter(|&&(dep, head)| {
                        head != 0 && dep > 0 && mask.get(dep - 1).copied().unwrap_or(false)
                    })
                    .map(|&(dep, head)| unordered(dep, head))
                    .collect()
            })
            .collect()
    }
}

/// Canonical orientation for an undirected edge
pub fn unordered(a: usize, b: usize) -> (usize, usize) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# sent_id = 1
# text = The cat sleeps.
1\tThe\tthe\tDET\tDT\t_\t2\tdet\t_\t_
2\tcat\tcat\tNOUN\tNN\t_\t3\tnsubj\t_\t_
3\tsleeps\tsleep\tVERB\tVBZ\t_\t0\troot\t_\t_
4\t.\t.\tPUNCT\t.\t_\t3\tpunct\t_\t_

# sent_id = 2
1-2\tdon't\t_\t_\t_\t_\t_\t_\t_\t_
1\tdo\tdo\tAUX\tVBP\t_\t3\taux\t_\t_
2\tn't\tnot\tPART\tRB\t_\t3\tadvmod\t_\t_
3\tgo\tgo\tVERB\tVB\t_\t0\troot\t_\t_
";

    #[test]
    fn test_parse_fields() {
        let corpus = Corpus::parse(SAMPLE, "sample.conllu").unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.tokens()[0], vec!["The", "cat", "sleeps", "."]);
        assert_eq!(corpus.lemmas()[0][2], "sleep");
        assert_eq!(corpus.pos()[0][3], "PUNCT");
        assert_eq!(corpus.relations()[0], vec![(1, 2), (2, 3), (3, 0), (4, 3)]);
        assert_eq!(corpus.roots(), &[vec![3], vec![3]]);
        // the multiword range row is not a word
        assert_eq!(corpus.tokens()[1], vec!["do", "n't", "go"]);
        assert_eq!(corpus.word_count(), vec![4, 3]);
    }

    #[test]
    fn test_trailing_sentence_without_blank_line() {
        let text = "1\tHi\thi\tINTJ\t_\t_\t0\troot\t_\t_";
        let corpus = Corpus::parse(text, "t").unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn test_malformed_row_is_error() {
        let text = "1\tHi\thi\tINTJ\n";
        assert!(Corpus::parse(text, "t").is_err());
        let text = "1\tHi\thi\tINTJ\t_\t_\tx\troot\t_\t_\n";
        assert!(Corpus::parse(text, "t").is_err());
        let text = "1\tHi\thi\tINTJ\t_\t_\t_\t_\t_\t_\n";
        assert!(Corpus::parse(text, "t").is_err());
    }

    #[test]
    fn test_derived_views() {
        let corpus = Corpus::parse(SAMPLE, "s").unwrap();
        assert_eq!(corpus.unlabeled_relations()[0][&1], 2);
        assert_eq!(corpus.punctuation_mask()[0], vec![true, true, true, false]);

        let edges = &corpus.unlabeled_unordered_relations()[0];
        // root attachment and punctuation dependent are excluded
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&(1, 2)));
        assert!(edges.contains(&(2, 3)));
    }

    #[test]
    fn test_without_keeps_fields_in_step() {
        let corpus = Corpus::parse(SAMPLE, "s").unwrap();
        let filtered = corpus.without(&BTreeSet::from([0]));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.tokens().len(), 1);
        assert_eq!(filtered.lemmas().len(), 1);
        assert_eq!(filtered.pos().len(), 1);
        assert_eq!(filtered.roots().len(), 1);
        assert_eq!(filtered.tokens()[0][0], "do");
        assert_eq!(filtered.lemmas()[0][1], "not");
        assert_eq!(filtered.relations()[0][2], (3, 0));
        // original untouched
        assert_eq!(corpus.len(), 2);
    }
}
