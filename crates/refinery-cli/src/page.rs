use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use refinery_contracts::events::StreamFrame;

const STYLE: &str = r#"<style>
body { font-family: ui-monospace, Menlo, Consolas, monospace; background: #0f1115; color: #d8dee9; margin: 0; }
main { max-width: 960px; margin: 0 auto; padding: 24px; }
h1 { font-size: 20px; letter-spacing: 0.04em; }
form { border: 1px dashed #4c566a; padding: 20px; border-radius: 6px; }
button { margin-top: 12px; padding: 8px 18px; background: #5e81ac; color: #fff; border: 0; border-radius: 4px; cursor: pointer; }
.flash { background: #bf616a; color: #fff; padding: 10px 14px; border-radius: 4px; margin-bottom: 16px; }
#evidence { display: flex; flex-wrap: wrap; gap: 8px; margin-bottom: 16px; }
#evidence figure { margin: 0; font-size: 11px; }
#evidence img { max-width: 160px; max-height: 160px; display: block; border: 1px solid #4c566a; }
#log div { white-space: pre-wrap; padding: 2px 0; }
.k-INFO { color: #88c0d0; } .k-NET { color: #b48ead; } .k-DATA { color: #a3be8c; }
.k-WARN { color: #ebcb8b; } .k-SUCCESS { color: #8fbcbb; font-weight: bold; } .k-ERROR { color: #bf616a; font-weight: bold; }
#report { display: none; margin-top: 20px; border-top: 1px solid #4c566a; padding-top: 16px; }
#report-text { white-space: pre-wrap; font-family: Georgia, serif; line-height: 1.5; }
</style>"#;

const CLIENT_SCRIPT: &str = r#"<script>
let refineryReported = false;
function refineryLine(kind, message, ts) {
  const row = document.createElement('div');
  row.className = 'k-' + kind;
  row.textContent = (ts ? '[' + ts.slice(11, 23) + '] ' : '') + kind.padEnd(8) + message;
  document.getElementById('log').appendChild(row);
  window.scrollTo(0, document.body.scrollHeight);
}
function refineryText(text64) {
  const bytes = Uint8Array.from(atob(text64), (c) => c.charCodeAt(0));
  return new TextDecoder('utf-8').decode(bytes);
}
function refineryFrame(frame, text64) {
  if (!frame) { return; }
  if (frame.frame === 'evidence') {
    const box = document.getElementById('evidence');
    for (const item of frame.items) {
      const fig = document.createElement('figure');
      if (item.data_base64) {
        const img = document.createElement('img');
        img.src = 'data:' + item.mime + ';base64,' + item.data_base64;
        fig.appendChild(img);
      }
      const caption = document.createElement('figcaption');
      caption.textContent = item.filename + ' ' + item.width + 'x' + item.height;
      fig.appendChild(caption);
      box.appendChild(fig);
    }
  } else if (frame.frame === 'progress') {
    refineryLine(frame.kind, frame.message, frame.ts);
  } else if (frame.frame === 'report') {
    refineryReported = true;
    document.getElementById('report-meta').textContent =
      frame.verdict + ' | score ' + frame.final_score + '/100 | ' +
      frame.attempts_used + ' of ' + frame.max_attempts + ' attempt(s) | ' + frame.model;
    document.getElementById('report-text').textContent = refineryText(text64 || '');
    document.getElementById('report').style.display = 'block';
  }
}
function refineryDone() {
  if (!refineryReported) {
    refineryLine('ERROR', 'Processing ended without a final report.', '');
  }
}
</script>"#;

pub fn index(flash: Option<&str>) -> String {
    let flash = flash
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(|message| format!("<div class=\"flash\">{}</div>", escape_html(message)))
        .unwrap_or_default();
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Refinery</title>{STYLE}</head>\
         <body><main><h1>Multi-image analysis</h1>{flash}\
         <form method=\"post\" action=\"/processar\" enctype=\"multipart/form-data\">\
         <input type=\"file\" name=\"files\" accept=\"image/*\" multiple>\
         <br><button type=\"submit\">Process</button></form></main></body></html>\n"
    )
}

/// Opening of the streamed result page; frames follow as individual scripts.
pub fn stream_head(run_id: &str) -> String {
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Refinery run</title>{STYLE}{CLIENT_SCRIPT}</head>\
         <body><main><h1>Run {}</h1><div id=\"evidence\"></div><div id=\"log\"></div>\
         <section id=\"report\"><h2>Final report</h2><p id=\"report-meta\"></p><div id=\"report-text\"></div></section>\
         <p><a href=\"/\">New analysis</a></p>\n",
        escape_html(run_id)
    )
}

pub fn frame_script(frame: &StreamFrame) -> String {
    match frame {
        StreamFrame::Report(summary) => {
            let text64 = BASE64.encode(summary.final_text.as_bytes());
            let mut meta = summary.clone();
            meta.final_text.clear();
            format!(
                "<script>refineryFrame({}, \"{text64}\");</script>\n",
                script_json(&StreamFrame::Report(meta))
            )
        }
        other => format!("<script>refineryFrame({});</script>\n", script_json(other)),
    }
}

pub fn stream_tail() -> String {
    "<script>refineryDone();</script></main></body></html>\n".to_string()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// JSON that is safe inside a `<script>` element.
fn script_json(frame: &StreamFrame) -> String {
    let Ok(json) = serde_json::to_string(frame) else {
        return "null".to_string();
    };
    json.replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use refinery_contracts::events::{ProgressEvent, ProgressKind, StreamFrame};
    use refinery_contracts::runs::iteration::Verdict;
    use refinery_contracts::runs::summary::RunSummary;

    use super::{escape_html, frame_script, index, BASE64};

    #[test]
    fn flash_message_is_escaped() {
        let html = index(Some("<b>bad</b> & 'worse'"));
        assert!(html.contains("&lt;b&gt;bad&lt;/b&gt; &amp; &#39;worse&#39;"));
        assert!(!html.contains("<b>bad"));
        assert!(!index(None).contains("class=\"flash\""));
    }

    #[test]
    fn progress_script_cannot_close_its_element() {
        let frame = StreamFrame::Progress(ProgressEvent {
            seq: 1,
            run_id: "r".to_string(),
            kind: ProgressKind::Data,
            message: "</script><script>alert(1)</script>".to_string(),
            ts: "2026-01-01T00:00:00.000000Z".to_string(),
        });
        let script = frame_script(&frame);
        assert_eq!(script.matches("</script>").count(), 1);
        assert!(script.contains("\\u003c/script\\u003e"));
    }

    #[test]
    fn report_text_travels_as_base64_utf8() -> anyhow::Result<()> {
        let summary = RunSummary {
            run_id: "r".to_string(),
            model: "dryrun-vision-1".to_string(),
            started_at: String::new(),
            finished_at: String::new(),
            verdict: Verdict::Accepted,
            attempts_used: 1,
            max_attempts: 3,
            target_score: 85,
            final_score: 90,
            final_text: "Relatório <final> ✓".to_string(),
            base_report: String::new(),
            iterations: Vec::new(),
        };
        let script = frame_script(&StreamFrame::Report(summary));
        assert!(!script.contains("<final>"));
        let encoded = script
            .split('"')
            .rev()
            .nth(1)
            .unwrap_or_default();
        assert_eq!(
            String::from_utf8(BASE64.decode(encoded)?)?,
            "Relatório <final> ✓"
        );
        Ok(())
    }

    #[test]
    fn escape_html_leaves_plain_text() {
        assert_eq!(escape_html("plain text 123"), "plain text 123");
    }
}
