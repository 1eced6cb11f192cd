//! Report content for one prediction. Layout and pagination are left to
//! whatever consumes the rendered Markdown.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use shared::ClassLabel;

use crate::history::PredictionRecord;

pub const REPORT_TITLE: &str = "Bone Cancer Detection Report";

const DISCLAIMER: &[&str] = &[
    "This analysis should NOT be used as the sole basis for medical decisions",
    "False positives and false negatives are possible with any AI system",
    "Always consult qualified medical professionals for diagnosis and treatment",
    "This system is intended as a decision support tool for healthcare providers",
    "The developers assume no liability for medical decisions based on this report",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ReportDocument {
    pub report_id: String,
    pub generated_at: DateTime<Utc>,
    pub patient_id: String,
    pub prediction_class: ClassLabel,
    pub confidence_cancer: f32,
    pub confidence_normal: f32,
    pub original_image: String,
    pub heatmap_image: String,
}

impl ReportDocument {
    pub fn build(record: &PredictionRecord, generated_at: DateTime<Utc>) -> Self {
        Self {
            report_id: format!("BCR-{}", generated_at.format("%Y%m%d%H%M%S")),
            generated_at,
            patient_id: record.owner.clone(),
            prediction_class: record.prediction_class,
            confidence_cancer: record.confidence_cancer,
            confidence_normal: record.confidence_normal,
            original_image: record.original_image_path.display().to_string(),
            heatmap_image: record.heatmap_image_path.display().to_string(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self.prediction_class {
            ClassLabel::Cancer => "CANCER DETECTED",
            ClassLabel::Normal => "NORMAL",
        }
    }

    fn confidence(&self) -> f32 {
        match self.prediction_class {
            ClassLabel::Cancer => self.confidence_cancer,
            ClassLabel::Normal => self.confidence_normal,
        }
    }

    fn summary(&self) -> String {
        let confidence = percent(self.confidence());
        match self.prediction_class {
            ClassLabel::Cancer => format!(
                "The model detected **abnormal patterns** in the X-ray image that are consistent \
                 with bone cancer. The model confidence is **{confidence}**.\n\n\
                 The GradCAM heatmap highlights the regions of the image that most influenced this \
                 classification. Red/yellow areas indicate regions of high importance for the \
                 cancer detection.\n\n\
                 **Important:** This is a preliminary screening result. Immediate consultation with \
                 a qualified radiologist or oncologist is strongly recommended for confirmation and \
                 treatment planning."
            ),
            ClassLabel::Normal => format!(
                "The model classified the X-ray as **normal** with a confidence of \
                 **{confidence}**. No significant abnormalities consistent with bone cancer were \
                 detected.\n\n\
                 The GradCAM heatmap shows the regions that influenced this normal \
                 classification.\n\n\
                 **Note:** While this result is encouraging, it should not replace professional \
                 medical evaluation. Regular check-ups and consultations with healthcare \
                 providers are recommended."
            ),
        }
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_markdown(&mut out);
        out
    }

    fn write_markdown(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "# {}\n", REPORT_TITLE)?;

        writeln!(out, "## Report Information\n")?;
        writeln!(out, "| | |\n|---|---|")?;
        writeln!(out, "| Report Date | {} |", self.generated_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out, "| Patient ID | {} |", self.patient_id)?;
        writeln!(out, "| Report ID | {} |\n", self.report_id)?;

        writeln!(out, "## Detection Results\n")?;
        writeln!(out, "| | |\n|---|---|")?;
        writeln!(out, "| Classification | **{}** |", self.status())?;
        writeln!(out, "| Cancer Confidence | {} |", percent(self.confidence_cancer))?;
        writeln!(out, "| Normal Confidence | {} |\n", percent(self.confidence_normal))?;

        writeln!(out, "## Visual Analysis\n")?;
        writeln!(out, "- Original X-ray: `{}`", self.original_image)?;
        writeln!(out, "- GradCAM Heatmap: `{}`\n", self.heatmap_image)?;

        writeln!(out, "## Analysis Summary\n")?;
        writeln!(out, "{}\n", self.summary())?;

        writeln!(out, "## Medical Disclaimer\n")?;
        writeln!(
            out,
            "This report is generated by an artificial intelligence system for preliminary \
             screening purposes only. It is NOT a substitute for professional medical diagnosis.\n"
        )?;
        for line in DISCLAIMER {
            writeln!(out, "- {}", line)?;
        }
        writeln!(
            out,
            "\n**For medical emergencies, contact your healthcare provider or emergency services \
             immediately.**"
        )
    }
}

fn percent(value: f32) -> String {
    format!("{:.2}%", value * 100.0)
}
