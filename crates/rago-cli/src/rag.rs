//! Subcommand: `rago rag` -- knowledge base management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rago_agent::tools::rag::{IngestRequest, QueryRequest, QueryResponse};
use rago_agent::{Embedder, LlmProvider, RagProcessor, RagoConfig, SqliteRag};
use rago_store::Document;
use tracing::info;

use crate::app::{open_rag, openai_client};
use crate::cli::RagAction;
use crate::helpers::{confirm, parse_metadata, read_file, truncate};

pub async fn handle(config: RagoConfig, action: RagAction) -> Result<()> {
    match action {
        RagAction::List { metadata, compact } => {
            let rag = open_rag(&config, None, None).await?;
            let documents = rag.list_documents().await.context("failed to list documents")?;
            print!("{}", render_documents(&documents, metadata, compact));
        }
        RagAction::Ingest {
            paths,
            text,
            source,
            metadata,
        } => {
            let metadata = parse_metadata(&metadata)?;
            let rag = with_models(&config, false).await?;
            let requests = match text {
                Some(text) => vec![IngestRequest {
                    source,
                    metadata,
                    ..IngestRequest::text(text)
                }],
                None if paths.is_empty() => bail!("nothing to ingest: pass files or --text"),
                None => paths
                    .into_iter()
                    .map(|path| IngestRequest {
                        metadata: metadata.clone(),
                        ..IngestRequest::file(path)
                    })
                    .collect(),
            };
            for request in requests {
                let label = request
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<text>".to_owned());
                let response = rag
                    .ingest(request)
                    .await
                    .with_context(|| format!("failed to ingest {label}"))?;
                println!("{label}: {} chunks (document {})", response.chunks, response.document_id);
            }
        }
        RagAction::Query {
            query,
            top_k,
            no_answer,
            json,
        } => {
            let rag = with_models(&config, !no_answer).await?;
            let mut request = QueryRequest::new(query).top_k(top_k.unwrap_or(config.sqvect.top_k));
            if !no_answer {
                request = request.with_answer();
            }
            let response = rag.query(request).await.context("query failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print!("{}", render_answer(&response));
            }
        }
        RagAction::Reset { yes } => {
            let rag = open_rag(&config, None, None).await?;
            let (documents, chunks) = rag.count().await?;
            if !yes && !confirm(&format!("Delete {documents} documents and {chunks} chunks?"))? {
                println!("Aborted.");
                return Ok(());
            }
            rag.reset().await.context("failed to reset knowledge base")?;
            println!("Knowledge base reset.");
        }
        RagAction::Import { file } => {
            let rag = open_rag(&config, None, None).await?;
            let json = read_file(&file)?;
            let n = rag.import(&json).await.with_context(|| format!("failed to import {}", file.display()))?;
            println!("Imported {n} documents.");
        }
        RagAction::Export { file } => {
            let rag = open_rag(&config, None, None).await?;
            let json = rag.export().await.context("failed to export knowledge base")?;
            write_export(file, &json)?;
        }
    }
    Ok(())
}

/// Knowledge base with the embedder, and the LLM when answers are wanted.
async fn with_models(config: &RagoConfig, answer: bool) -> Result<SqliteRag> {
    let client = openai_client(config)?;
    let llm: Option<Arc<dyn LlmProvider>> = answer.then(|| client.clone() as Arc<dyn LlmProvider>);
    open_rag(config, Some(client as Arc<dyn Embedder>), llm).await
}

fn write_export(file: Option<PathBuf>, json: &str) -> Result<()> {
    match file {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "export written");
            println!("Exported to {}.", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

pub fn render_documents(documents: &[Document], metadata: bool, compact: bool) -> String {
    if documents.is_empty() {
        return "No documents indexed.\n".to_owned();
    }
    let mut out = String::new();
    for doc in documents {
        if compact {
            out.push_str(&format!("{}  {}  ({} chunks)\n", short_id(&doc.id), doc.source, doc.chunk_count));
            continue;
        }
        out.push_str(&format!("ID:      {}\n", doc.id));
        out.push_str(&format!("Source:  {}\n", doc.source));
        out.push_str(&format!("Chunks:  {}\n", doc.chunk_count));
        out.push_str(&format!("Created: {}\n", doc.created_at.format("%Y-%m-%d %H:%M:%S")));
        if metadata && !doc.metadata.is_empty() {
            out.push_str("Metadata:\n");
            for (key, value) in &doc.metadata {
                out.push_str(&format!("  {key}: {value}\n"));
            }
        }
        out.push('\n');
    }
    out.push_str(&format!("{} documents\n", documents.len()));
    out
}

fn render_answer(response: &QueryResponse) -> String {
    let mut out = String::new();
    if !response.answer.is_empty() {
        out.push_str(response.answer.trim());
        out.push_str("\n\n");
    }
    if response.sources.is_empty() {
        out.push_str("No matching chunks.\n");
        return out;
    }
    out.push_str("Sources:\n");
    for (i, source) in response.sources.iter().enumerate() {
        out.push_str(&format!(
            "  [{}] {:.3}  {}  {}\n",
            i + 1,
            source.score,
            short_id(&source.document_id),
            truncate(&source.content, 100)
        ));
    }
    out
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
