//! Per-endpoint response rewriting rules.
//!
//! The upstream service returns loosely shaped JSON that differs between
//! near-identical endpoints. Each rule first classifies the body into one of the
//! shapes observed for its endpoint, then rewrites only what that shape carries.
//! A missing field is routine and simply selects the "absent" branch.

use serde_json::{Map, Value};

/// Value written into every forced text field.
pub const SENTINEL: &str = "a";

/// Substring of `testPaper.testPaperName` identifying an example-sentence paper.
pub const EXAMPLE_PAPER_MARKER: &str = "例句";

/// The upstream misspells the "correct" flag on option records; the rewrite must
/// use the same key for the client to honour it.
pub const OPTION_CORRECT_KEY: &str = "corrent";
pub const OPTION_CORRECT_VALUE: &str = "Y";

type Object = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedRule {
    Autopaper,
    StudyFlowNext,
    StrengthenNext,
}

impl WatchedRule {
    pub fn name(&self) -> &'static str {
        match self {
            WatchedRule::Autopaper => "autopaper",
            WatchedRule::StudyFlowNext => "study-flow-next",
            WatchedRule::StrengthenNext => "strengthen-next",
        }
    }

    /// Rewrite `body` in place according to this rule.
    pub fn apply(&self, body: &mut Value) {
        match self {
            WatchedRule::Autopaper => rewrite_autopaper(body),
            WatchedRule::StudyFlowNext => rewrite_study_flow_next(body),
            WatchedRule::StrengthenNext => rewrite_strengthen_next(body),
        }
    }
}

/// Observed shapes of the autopaper body.
enum AutopaperShape<'a> {
    Paper {
        example_sentences: bool,
        question_map: &'a mut Object,
    },
    Absent,
}

impl<'a> AutopaperShape<'a> {
    fn of(body: &'a mut Value) -> Self {
        let Some(paper) = body.get_mut("testPaper").and_then(Value::as_object_mut) else {
            return Self::Absent;
        };

        // A paper without a readable name is not one we know how to answer
        let Some(name) = paper.get("testPaperName").and_then(Value::as_str) else {
            return Self::Absent;
        };
        let example_sentences = name.contains(EXAMPLE_PAPER_MARKER);

        match paper.get_mut("questionMap").and_then(Value::as_object_mut) {
            Some(question_map) => Self::Paper {
                example_sentences,
                question_map,
            },
            None => Self::Absent,
        }
    }
}

/// Observed shapes of the studyFlow/next body.
enum StudyFlowShape<'a> {
    /// A spelling exercise, recognised by its `syllable` field.
    Syllable(&'a mut Object),
    /// A vocabulary card without `syllable`.
    Vocabulary(&'a mut Object),
    NotAnObject,
}

impl<'a> StudyFlowShape<'a> {
    fn of(body: &'a mut Value) -> Self {
        match body.as_object_mut() {
            Some(object) if object.contains_key("syllable") => Self::Syllable(object),
            Some(object) => Self::Vocabulary(object),
            None => Self::NotAnObject,
        }
    }
}

/// Observed shapes of the studyFlow/strengthenNext body.
enum StrengthenShape<'a> {
    Word(&'a mut Object),
    Absent,
}

impl<'a> StrengthenShape<'a> {
    fn of(body: &'a mut Value) -> Self {
        match body.get_mut("word").and_then(Value::as_object_mut) {
            Some(word) => Self::Word(word),
            None => Self::Absent,
        }
    }
}

fn set_sentinel(object: &mut Object, keys: &[&str]) {
    for key in keys {
        object.insert((*key).to_string(), Value::from(SENTINEL));
    }
}

fn set_vocabulary_fields(object: &mut Object) {
    object.insert("words".to_string(), Value::from(vec![SENTINEL]));
    set_sentinel(object, &["example_en_US", "example_zh_CN"]);
}

/// Mark every record of `answers` correct. Stops at the first record that is not
/// an object; a missing or non-list `answers` is left alone.
fn force_answers(object: &mut Object) {
    let Some(Value::Array(answers)) = object.get_mut("answers") else {
        return;
    };
    for answer in answers.iter_mut() {
        let Value::Object(answer) = answer else {
            break;
        };
        answer.insert("correct".to_string(), Value::Bool(true));
        set_sentinel(answer, &["meaning", "spelling"]);
    }
}

/// Same as [`force_answers`] for the `options` list, which uses the
/// [`OPTION_CORRECT_KEY`] flag.
fn force_options(object: &mut Object) {
    let Some(Value::Array(options)) = object.get_mut("options") else {
        return;
    };
    for option in options.iter_mut() {
        let Value::Object(option) = option else {
            break;
        };
        option.insert(
            OPTION_CORRECT_KEY.to_string(),
            Value::from(OPTION_CORRECT_VALUE),
        );
        set_sentinel(option, &["meaning", "spelling"]);
    }
}

fn rewrite_autopaper(body: &mut Value) {
    let AutopaperShape::Paper {
        example_sentences,
        question_map,
    } = AutopaperShape::of(body)
    else {
        return;
    };

    for questions in question_map.values_mut() {
        let Some(questions) = questions.as_array_mut() else {
            continue;
        };
        for item in questions.iter_mut().filter_map(Value::as_object_mut) {
            if example_sentences {
                set_vocabulary_fields(item);
                set_sentinel(item, &["spelling"]);
            } else {
                set_sentinel(item, &["spelling", "meaning"]);
            }
            force_answers(item);
        }
    }
}

fn rewrite_study_flow_next(body: &mut Value) {
    match StudyFlowShape::of(body) {
        StudyFlowShape::Syllable(object) => {
            set_sentinel(object, &["meaning", "spelling"]);
            force_answers(object);
            force_options(object);
        }
        StudyFlowShape::Vocabulary(object) => {
            set_vocabulary_fields(object);
            force_options(object);
        }
        StudyFlowShape::NotAnObject => {}
    }
}

fn rewrite_strengthen_next(body: &mut Value) {
    match StrengthenShape::of(body) {
        StrengthenShape::Word(word) => set_sentinel(word, &["syllable", "spelling", "soundMark"]),
        StrengthenShape::Absent => {}
    }
}
