//! Grouping of queued symbols into requests and prompt construction.

use crate::summarize::client::SummaryRequest;

/// Terminator the service must emit after the last summary. Its absence
/// means the reply was cut off.
pub const END_MARKER: &str = "END_OF_SUMMARIES";

const PROMPT_OVERHEAD_TOKENS: usize = 200;

/// Rough token estimate (chars / 3.5).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / 3.5).ceil().max(1.0) as usize
}

fn request_tokens(request: &SummaryRequest) -> usize {
    estimate_tokens(&request.source) + estimate_tokens(&request.signature)
}

/// A group of requests sent together. Request ids are positions in the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub requests: Vec<SummaryRequest>,
}

impl Batch {
    fn from_requests(mut requests: Vec<SummaryRequest>) -> Self {
        for (id, request) in requests.iter_mut().enumerate() {
            request.id = id;
        }
        Self { requests }
    }

    /// One request on its own, used by the individual fallback.
    pub fn single(request: &SummaryRequest) -> Self {
        Self::from_requests(vec![request.clone()])
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Pack requests in their given order. A batch is closed when adding the
/// next request would exceed `token_budget` or `max_symbols`. A request that
/// alone exceeds the budget gets a batch of its own.
pub fn build_batches(
    requests: Vec<SummaryRequest>,
    token_budget: usize,
    max_symbols: usize,
) -> Vec<Batch> {
    let max_symbols = max_symbols.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<SummaryRequest> = Vec::new();
    let mut current_tokens = PROMPT_OVERHEAD_TOKENS;

    for request in requests {
        let tokens = request_tokens(&request);
        let over_budget = current_tokens + tokens > token_budget;
        if !current.is_empty() && (over_budget || current.len() >= max_symbols) {
            batches.push(Batch::from_requests(std::mem::take(&mut current)));
            current_tokens = PROMPT_OVERHEAD_TOKENS;
        }
        current_tokens += tokens;
        current.push(request);
    }
    if !current.is_empty() {
        batches.push(Batch::from_requests(current));
    }
    batches
}

/// Prompt for one batch.
pub fn build_prompt(requests: &[SummaryRequest]) -> String {
    let mut prompt = String::from(
        "You are indexing a Python codebase. For every code unit below, write one \
         concise sentence describing what it does, and name where its data comes \
         from (source) and where it goes (sink), or \"none\".\n\
         Reply with a JSON array of objects with the keys \"id\", \"summary\", \
         \"source\" and \"sink\", one object per unit, then a final line containing \
         only ",
    );
    prompt.push_str(END_MARKER);
    prompt.push_str(".\n");

    for request in requests {
        prompt.push_str(&format!(
            "\n### id={} {} `{}` ({})\n",
            request.id,
            request.kind.as_str(),
            request.signature,
            request.file_path
        ));
        let labels = request.markers.labels();
        if !labels.is_empty() {
            prompt.push_str(&format!("Notable constructs: {}\n", labels.join(", ")));
        }
        prompt.push_str("```python\n");
        prompt.push_str(request.source.trim_end());
        prompt.push_str("\n```\n");
    }
    prompt
}
