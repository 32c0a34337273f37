/// One physical line of a wrapped caption, positioned for drawing.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub text: String,
    pub x: f32,
    pub y: f32,
}

/// Greedy word wrap against an injected measurement function.
///
/// Words are accumulated into a candidate line; a word that would push the
/// candidate past `max_width` commits the current line (without that word)
/// and starts the next one, but only if the candidate already holds at least
/// one word — a single word wider than `max_width` is never split and is
/// placed alone on an overflowing line. The final candidate is always
/// committed. Empty text yields a single empty line.
///
/// Committed line text keeps a trailing space, matching what the drawing
/// code historically received from the canvas-based wrapper.
pub fn wrap_text(
    measure: impl Fn(&str) -> f32,
    text: &str,
    x: f32,
    y: f32,
    max_width: f32,
    line_height: f32,
) -> Vec<TextLine> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![TextLine {
            text: String::new(),
            x,
            y,
        }];
    }

    let mut lines = Vec::new();
    let mut line_y = y;
    let mut candidate = words[0].to_owned();

    for word in &words[1..] {
        let extended = format!("{candidate} {word}");
        if measure(&extended) > max_width {
            lines.push(TextLine {
                text: format!("{candidate} "),
                x,
                y: line_y,
            });
            line_y += line_height;
            candidate = (*word).to_owned();
        } else {
            candidate = extended;
        }
    }

    lines.push(TextLine {
        text: format!("{candidate} "),
        x,
        y: line_y,
    });
    lines
}
