use async_trait::async_trait;
use serde::Serialize;

use super::ConversationTurn;
use crate::Result;
use crate::rerank::RankedResult;
use crate::retrieval::Concept;
use crate::text;

const SNIPPET_MAX_CHARS: usize = 280;

/// Inputs available when building a reply
#[derive(Debug, Clone, Copy)]
pub struct AssemblyRequest<'a> {
    pub user_input: &'a str,
    pub history: &'a [ConversationTurn],
    pub concepts: &'a [Concept],
    /// Reranked knowledge, best first
    pub context: &'a [RankedResult],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledResponse {
    pub text: String,
    /// How well the reply fits the request, in [0, 1]
    pub confidence: f32,
    /// Ids of the knowledge records the reply drew on
    pub sources: Vec<String>,
}

/// Builds the reply text the pipeline then verifies
#[async_trait]
pub trait ResponseAssembler: Send + Sync + std::fmt::Debug {
    async fn assemble(&self, request: &AssemblyRequest<'_>) -> Result<AssembledResponse>;
}

/// Static templates keyed by the first detected concept
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateAssembler;

impl TemplateAssembler {
    #[inline]
    pub fn new() -> Self {
        Self
    }

    /// The opening line for a concept, or the general one
    #[inline]
    pub fn opening(concept: Option<Concept>) -> &'static str {
        match concept {
            Some(Concept::Anxiety) => {
                "It sounds like anxiety has a strong grip right now. Slowing your breathing for a minute can take some of the edge off."
            }
            Some(Concept::Grief) => {
                "Losing someone changes everything, and grief rarely follows a straight line. There is no right way to feel this."
            }
            Some(Concept::Depression) => {
                "When everything feels heavy, even small steps count. Being gentle with yourself matters today."
            }
            Some(Concept::Stress) => {
                "That is a lot to carry at once. Naming the one thing that needs attention first can make it feel more manageable."
            }
            Some(Concept::Loneliness) => {
                "Feeling disconnected is painful, and it is more common than it seems. Reaching out to one person, even briefly, can help."
            }
            Some(Concept::Sleep) => {
                "Rest can be hard to come by when your mind keeps going. A steady wind-down routine often helps more than forcing sleep."
            }
            Some(Concept::Anger) => {
                "Anger often points at something that matters to you. Giving yourself a pause before reacting can help you choose what to do next."
            }
            Some(Concept::Relationships) => {
                "Relationships can bring up strong feelings. It can help to notice what you need from this connection."
            }
            Some(Concept::SelfWorth) => {
                "Being hard on yourself is exhausting. You deserve the same kindness you would offer a friend."
            }
            None => "Thank you for telling me what's going on. Let's take it one step at a time.",
        }
    }
}

#[async_trait]
impl ResponseAssembler for TemplateAssembler {
    async fn assemble(&self, request: &AssemblyRequest<'_>) -> Result<AssembledResponse> {
        let opening = Self::opening(request.concepts.first().copied());

        let Some(top) = request.context.first() else {
            return Ok(AssembledResponse {
                text: opening.to_string(),
                confidence: 0.6,
                sources: Vec::new(),
            });
        };

        let snippet = snippet(&top.content);
        let text = if snippet.is_empty() {
            opening.to_string()
        } else {
            format!("{} Something that may help: {}", opening, snippet)
        };

        Ok(AssembledResponse {
            text,
            confidence: 0.8,
            sources: vec![top.id.clone()],
        })
    }
}

/// First sentence of `content`, cut at a word boundary when it runs long
fn snippet(content: &str) -> String {
    let Some(first) = text::sentences(content).into_iter().next() else {
        return String::new();
    };
    if first.text.chars().count() <= SNIPPET_MAX_CHARS {
        return first.text.to_string();
    }

    let mut out = String::new();
    for word in first.text.split_whitespace() {
        if out.chars().count() + word.chars().count() + 1 > SNIPPET_MAX_CHARS {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out.push_str("...");
    out
}
