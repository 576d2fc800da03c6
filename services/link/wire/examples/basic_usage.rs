//! Basic usage example for the link wire protocol.

use link_wire::{Message, MessageDecoder, PeerId, Request, Response, status};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Link Wire Protocol Example ===\n");

    // 1. Build and finalize a request
    println!("1. Creating a request...");
    let mut request: Message = Request::new(PeerId(2), "/scene/load", "level-3")
        .with_header("content-type", "text/plain")
        .into();
    request.finalize(PeerId(1), Some(42))?;

    let request_bytes = request.encode()?;
    println!("   Encoded request size: {} bytes", request_bytes.len());

    // 2. Build the matching response
    println!("\n2. Creating the response...");
    let Message::Request(sent) = &request else {
        unreachable!("built as a request");
    };
    let mut response: Message = Response::reply_to(sent, status::OK, "loaded").into();
    response.finalize(PeerId(2), None)?;
    let response_bytes = response.encode()?;
    println!("   Encoded response size: {} bytes", response_bytes.len());

    // 3. Feed both through a decoder in awkward pieces
    println!("\n3. Decoding a split stream...");
    let mut stream = request_bytes.to_vec();
    stream.extend_from_slice(&response_bytes);

    let mut decoder = MessageDecoder::new();
    let mut pending = Vec::new();
    for piece in stream.chunks(7) {
        pending.extend_from_slice(piece);
        let parsed = decoder.parse_messages(&pending);
        pending = parsed.leftover.to_vec();

        for message in parsed.messages {
            match message {
                Message::Request(request) => println!(
                    "   Request {} from {} for {} ({} content bytes)",
                    request.envelope.message_id,
                    request.source(),
                    request.target,
                    request.content.len()
                ),
                Message::Response(response) => println!(
                    "   Response {} from {}: {} {:?}",
                    response.envelope.message_id,
                    response.source(),
                    response.status_code(),
                    std::str::from_utf8(&response.content)
                ),
            }
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
